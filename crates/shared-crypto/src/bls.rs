//! BLS12-381 Signature Implementation
//!
//! Attestation keys. Signatures live in G2 and public keys in G1 (`min_pk`),
//! so committee aggregates verify with one pairing over the aggregated key.
//!
//! Aggregates are only sound against rogue-key attacks when every key has a
//! verified proof of possession; the registry checks one at registration.

use blst::min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{Bytes, DeserializeAs, SerializeAs};
use zeroize::Zeroize;

use crate::CryptoError;

/// Domain separation tag for attestation signatures.
pub(crate) const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Domain separation tag for proofs of possession.
const POP_DST: &[u8] = b"BLS_POP_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Compressed public key length.
pub const BLS_PUBLIC_KEY_LEN: usize = 48;

/// Compressed signature length.
pub const BLS_SIGNATURE_LEN: usize = 96;

/// BLS public key (48 bytes compressed, subgroup-checked on decode)
#[derive(Clone, Debug)]
pub struct BlsPublicKey(PublicKey);

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsPublicKey {}

/// BLS signature (96 bytes)
#[derive(Clone, Debug)]
pub struct BlsSignature(Signature);

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsSignature {}

/// BLS key pair for signing operations
pub struct BlsKeyPair {
    secret: SecretKey,
    public: BlsPublicKey,
}

impl BlsKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self, CryptoError> {
        let mut ikm = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ikm);
        let keypair = Self::from_ikm(&ikm);
        ikm.zeroize();
        keypair
    }

    /// Deterministic key generation from 32 bytes of input key material
    pub fn from_ikm(ikm: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::key_gen(ikm, &[])
            .map_err(|e| CryptoError::KeyGenerationFailed(format!("{e:?}")))?;
        let public = BlsPublicKey(secret.sk_to_pk());
        Ok(Self { secret, public })
    }

    /// Create from existing secret key bytes
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        let public = BlsPublicKey(secret.sk_to_pk());
        Ok(Self { secret, public })
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        self.sign_with_dst(message, DST)
    }

    pub(crate) fn sign_with_dst(&self, message: &[u8], dst: &[u8]) -> BlsSignature {
        BlsSignature(self.secret.sign(message, dst, &[]))
    }

    /// Sign the compressed public key under the proof-of-possession tag.
    pub fn proof_of_possession(&self) -> BlsSignature {
        self.sign_with_dst(&self.public.to_bytes(), POP_DST)
    }

    /// Get the public key
    pub fn public_key(&self) -> BlsPublicKey {
        self.public.clone()
    }

    /// Get the secret key bytes
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl BlsPublicKey {
    /// Verify a signature against this public key
    pub fn verify(&self, message: &[u8], signature: &BlsSignature) -> bool {
        self.verify_with_dst(message, signature, DST)
    }

    pub(crate) fn verify_with_dst(&self, message: &[u8], signature: &BlsSignature, dst: &[u8]) -> bool {
        signature.0.verify(true, message, dst, &[], &self.0, true) == BLST_ERROR::BLST_SUCCESS
    }

    /// Verify a proof of possession produced by [`BlsKeyPair::proof_of_possession`].
    pub fn verify_possession(&self, proof: &BlsSignature) -> bool {
        self.verify_with_dst(&self.to_bytes(), proof, POP_DST)
    }

    /// Create from 48-byte compressed representation
    pub fn from_bytes(bytes: &[u8; BLS_PUBLIC_KEY_LEN]) -> Result<Self, CryptoError> {
        PublicKey::key_validate(bytes)
            .map(BlsPublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Serialize to 48-byte compressed form
    pub fn to_bytes(&self) -> [u8; BLS_PUBLIC_KEY_LEN] {
        self.0.to_bytes()
    }

    /// Aggregate multiple public keys into one
    pub fn aggregate(keys: &[&BlsPublicKey]) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::InvalidInput("empty key list".into()));
        }
        let refs: Vec<&PublicKey> = keys.iter().map(|k| &k.0).collect();
        AggregatePublicKey::aggregate(&refs, false)
            .map(|apk| BlsPublicKey(apk.to_public_key()))
            .map_err(|_| CryptoError::AggregationFailed)
    }
}

impl BlsSignature {
    /// Create from 96-byte representation
    pub fn from_bytes(bytes: &[u8; BLS_SIGNATURE_LEN]) -> Result<Self, CryptoError> {
        Signature::from_bytes(bytes)
            .map(BlsSignature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Serialize to 96-byte form
    pub fn to_bytes(&self) -> [u8; BLS_SIGNATURE_LEN] {
        self.0.to_bytes()
    }

    /// Aggregate multiple signatures into one
    pub fn aggregate(sigs: &[&BlsSignature]) -> Result<Self, CryptoError> {
        if sigs.is_empty() {
            return Err(CryptoError::InvalidInput("empty signature list".into()));
        }
        let refs: Vec<&Signature> = sigs.iter().map(|s| &s.0).collect();
        AggregateSignature::aggregate(&refs, true)
            .map(|asig| BlsSignature(asig.to_signature()))
            .map_err(|_| CryptoError::AggregationFailed)
    }

    /// Point-add another signature onto this one.
    pub fn combine(&self, other: &BlsSignature) -> Result<Self, CryptoError> {
        let mut agg = AggregateSignature::from_signature(&self.0);
        agg.add_signature(&other.0, true)
            .map_err(|_| CryptoError::AggregationFailed)?;
        Ok(BlsSignature(agg.to_signature()))
    }

    /// Verify an aggregate where every signer signed the same message.
    ///
    /// The keys must carry verified proofs of possession.
    pub fn fast_aggregate_verify(&self, message: &[u8], keys: &[&BlsPublicKey]) -> bool {
        if keys.is_empty() {
            return false;
        }
        let refs: Vec<&PublicKey> = keys.iter().map(|k| &k.0).collect();
        self.0.fast_aggregate_verify(true, message, DST, &refs) == BLST_ERROR::BLST_SUCCESS
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Bytes::serialize_as(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; BLS_PUBLIC_KEY_LEN] = Bytes::deserialize_as(deserializer)?;
        BlsPublicKey::from_bytes(&bytes).map_err(D::Error::custom)
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Bytes::serialize_as(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; BLS_SIGNATURE_LEN] = Bytes::deserialize_as(deserializer)?;
        BlsSignature::from_bytes(&bytes).map_err(D::Error::custom)
    }
}
