//! Wire messages exchanged between consensus nodes.
//!
//! Every frame is a bincode-encoded [`NetworkMessage`] bounded by
//! `shared_types::MAX_FRAME_SIZE`.
//!
//! A block is a signed header ([`ProposalMessage`]) plus a [`BlockBody`]. The
//! header hash commits to the body root, so the tickets, votes, evidence and
//! registry operations a block carries are as binding as its parent link.
//! Slashing evidence carries headers only.

use crate::domain::attestation::Attestation;
use crate::domain::selection::Ticket;
use crate::domain::slashing::SlashingEvidence;
use crate::domain::validator::{Registration, ValidatorId};
use serde::{Deserialize, Serialize};
use shared_crypto::{
    blake3_hash_many, Blake3Hasher, CryptoError, Ed25519KeyPair, Ed25519PublicKey,
    Ed25519Signature,
};
use shared_types::{codec, CodecError, EpochNumber, Hash, Slot};

const BLOCK_DOMAIN: &[u8] = b"poc-block-v1";
const PROPOSAL_DOMAIN: &[u8] = b"poc-proposal-v1";
const BODY_DOMAIN: &[u8] = b"poc-body-v1";
const EXIT_DOMAIN: &[u8] = b"poc-exit-v1";

/// Content hash of a block header.
pub fn compute_block_hash(
    proposer: &ValidatorId,
    slot: Slot,
    parent_hash: &Hash,
    state_root: &Hash,
    body_root: &Hash,
) -> Hash {
    let mut hasher = Blake3Hasher::new();
    hasher
        .update(BLOCK_DOMAIN)
        .update(proposer.as_bytes())
        .update(&slot.to_be_bytes())
        .update(parent_hash)
        .update(state_root)
        .update(body_root);
    hasher.finalize()
}

/// A signed block header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalMessage {
    pub proposer: ValidatorId,
    pub slot: Slot,
    pub block_hash: Hash,
    pub parent_hash: Hash,
    pub state_root: Hash,
    pub body_root: Hash,
    pub signature: Ed25519Signature,
}

impl ProposalMessage {
    pub fn sign(
        key: &Ed25519KeyPair,
        proposer: ValidatorId,
        slot: Slot,
        parent_hash: Hash,
        state_root: Hash,
        body_root: Hash,
    ) -> Self {
        let block_hash = compute_block_hash(&proposer, slot, &parent_hash, &state_root, &body_root);
        let mut proposal = Self {
            proposer,
            slot,
            block_hash,
            parent_hash,
            state_root,
            body_root,
            signature: Ed25519Signature::from_bytes([0u8; 64]),
        };
        proposal.signature = key.sign(&proposal.signing_bytes());
        proposal
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PROPOSAL_DOMAIN.len() + 8 + 128);
        bytes.extend_from_slice(PROPOSAL_DOMAIN);
        bytes.extend_from_slice(&self.slot.to_be_bytes());
        bytes.extend_from_slice(&self.block_hash);
        bytes.extend_from_slice(&self.parent_hash);
        bytes.extend_from_slice(&self.state_root);
        bytes.extend_from_slice(&self.body_root);
        bytes
    }

    /// `block_hash` matches the header fields.
    pub fn has_valid_hash(&self) -> bool {
        self.block_hash
            == compute_block_hash(
                &self.proposer,
                self.slot,
                &self.parent_hash,
                &self.state_root,
                &self.body_root,
            )
    }

    pub fn verify(&self, key: &Ed25519PublicKey) -> Result<(), CryptoError> {
        key.verify(&self.signing_bytes(), &self.signature)
    }
}

/// Voluntary exit, signed with the validator's block-signing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedExit {
    pub validator: ValidatorId,
    /// Epoch in which the exit was requested
    pub epoch: EpochNumber,
    pub signature: Ed25519Signature,
}

impl SignedExit {
    pub fn sign(key: &Ed25519KeyPair, validator: ValidatorId, epoch: EpochNumber) -> Self {
        let mut exit = Self {
            validator,
            epoch,
            signature: Ed25519Signature::from_bytes([0u8; 64]),
        };
        exit.signature = key.sign(&exit.signing_bytes());
        exit
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(EXIT_DOMAIN.len() + 28);
        bytes.extend_from_slice(EXIT_DOMAIN);
        bytes.extend_from_slice(self.validator.as_bytes());
        bytes.extend_from_slice(&self.epoch.to_be_bytes());
        bytes
    }

    pub fn verify(&self, key: &Ed25519PublicKey) -> Result<(), CryptoError> {
        key.verify(&self.signing_bytes(), &self.signature)
    }
}

/// Registry change carried in a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Self-authenticated by the proof of possession
    Register(Registration),
    Exit(SignedExit),
}

impl Operation {
    /// Validator the operation is about.
    pub fn validator(&self) -> ValidatorId {
        match self {
            Self::Register(registration) => ValidatorId::from_signing_key(&registration.signing_key),
            Self::Exit(exit) => exit.validator,
        }
    }

    fn tag(&self) -> u64 {
        match self {
            Self::Register(_) => 0,
            Self::Exit(_) => 1,
        }
    }
}

/// Relay work the proposer measured for one validator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReport {
    pub validator: ValidatorId,
    pub messages: u64,
}

/// Everything a block carries besides its header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    /// Tickets for the epoch after the block's epoch
    pub tickets: Vec<Ticket>,
    pub attestations: Vec<Attestation>,
    pub evidence: Vec<EvidenceMessage>,
    pub operations: Vec<Operation>,
    pub relay: Vec<RelayReport>,
}

impl BlockBody {
    /// Commitment placed in the header.
    pub fn root(&self) -> Result<Hash, CodecError> {
        let bytes = codec::encode(self)?;
        Ok(blake3_hash_many(&[BODY_DOMAIN, bytes.as_slice()]))
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
            && self.attestations.is_empty()
            && self.evidence.is_empty()
            && self.operations.is_empty()
            && self.relay.is_empty()
    }
}

/// Header and body as gossiped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub proposal: ProposalMessage,
    pub body: BlockBody,
}

impl Block {
    pub fn sign(
        key: &Ed25519KeyPair,
        proposer: ValidatorId,
        slot: Slot,
        parent_hash: Hash,
        state_root: Hash,
        body: BlockBody,
    ) -> Result<Self, CodecError> {
        let body_root = body.root()?;
        Ok(Self {
            proposal: ProposalMessage::sign(key, proposer, slot, parent_hash, state_root, body_root),
            body,
        })
    }

    pub fn hash(&self) -> Hash {
        self.proposal.block_hash
    }

    pub fn slot(&self) -> Slot {
        self.proposal.slot
    }

    pub fn parent(&self) -> Hash {
        self.proposal.parent_hash
    }

    /// The header hash covers the header fields and this body.
    pub fn is_consistent(&self) -> bool {
        self.proposal.has_valid_hash()
            && self
                .body
                .root()
                .is_ok_and(|root| root == self.proposal.body_root)
    }
}

/// Evidence gossiped by a reporter. `reporter` receives the reward share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMessage {
    pub evidence: SlashingEvidence,
    pub reporter: Option<ValidatorId>,
}

/// Message kinds, used for deduplication and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Proposal,
    Attestation,
    Evidence,
    Ticket,
    Operation,
    BlockRequest,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposal => "proposal",
            Self::Attestation => "attestation",
            Self::Evidence => "evidence",
            Self::Ticket => "ticket",
            Self::Operation => "operation",
            Self::BlockRequest => "block_request",
        }
    }
}

/// Every frame on the consensus topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    Proposal(Block),
    Attestation(Attestation),
    Evidence(EvidenceMessage),
    Ticket(Ticket),
    Operation(Operation),
    /// Ask peers to re-send a block by hash
    BlockRequest(Hash),
}

impl NetworkMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Proposal(_) => MessageKind::Proposal,
            Self::Attestation(_) => MessageKind::Attestation,
            Self::Evidence(_) => MessageKind::Evidence,
            Self::Ticket(_) => MessageKind::Ticket,
            Self::Operation(_) => MessageKind::Operation,
            Self::BlockRequest(_) => MessageKind::BlockRequest,
        }
    }

    /// (validator, kind, slot) key under which duplicates collapse.
    ///
    /// Tickets are keyed by epoch in the slot position, operations by their
    /// variant and block requests by the leading bytes of the hash.
    pub fn dedup_key(&self) -> (ValidatorId, MessageKind, u64) {
        match self {
            Self::Proposal(b) => (b.proposal.proposer, MessageKind::Proposal, b.proposal.slot),
            Self::Attestation(a) => (a.validator, MessageKind::Attestation, a.data.slot),
            Self::Evidence(e) => (e.evidence.offender(), MessageKind::Evidence, e.evidence.slot()),
            Self::Ticket(t) => (t.validator, MessageKind::Ticket, t.epoch),
            Self::Operation(op) => (op.validator(), MessageKind::Operation, op.tag()),
            Self::BlockRequest(hash) => {
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&hash[..8]);
                (
                    ValidatorId::default(),
                    MessageKind::BlockRequest,
                    u64::from_be_bytes(prefix),
                )
            }
        }
    }
}
