//! # PoC Consensus Benchmarks
//!
//! Hot paths of an epoch:
//!
//! | Path | Work |
//! |------|------|
//! | Attestation batch verification | one BLS verify per vote, parallel past a threshold |
//! | Committee sealing | one sort over tickets plus a proposer scan per slot |
//! | Epoch scoring | one ledger update per registered validator |
//! | Ticket verification | one VRF proof check per ticket |
//! | Epoch transition | block operations, epoch close and the next assignment |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use poc_consensus::domain::{
    evaluate_ticket, verify_batch, verify_ticket, AttestationData, BlockBody, CheckpointRef,
    ContributionScorer, EpochAssignment, EpochSegment, EpochState, EpochTallies, SegmentBlock,
};
use poc_consensus::{Attestation, ConsensusConfig, ValidatorKeys, ValidatorRegistry};
use shared_types::U256;
use std::collections::BTreeMap;
use std::time::Duration;

fn keys(count: usize) -> Vec<ValidatorKeys> {
    (0..count)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[..8].copy_from_slice(&(i as u64 + 1).to_be_bytes());
            ValidatorKeys::from_seed(seed).expect("seeded keys")
        })
        .collect()
}

fn registry(keys: &[ValidatorKeys]) -> ValidatorRegistry {
    ValidatorRegistry::from_genesis(
        keys.iter()
            .map(|k| k.genesis_validator(U256::from(32_000u64)))
            .collect(),
    )
    .expect("distinct validators")
}

fn bench_attestation_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("attestation-batch-verify");
    group.measurement_time(Duration::from_secs(10));

    for size in [4usize, 32, 128] {
        let keys = keys(size);
        let registry = registry(&keys);
        let data = AttestationData {
            slot: 10,
            source: CheckpointRef::new(0, [0; 32]),
            target: CheckpointRef::new(1, [1; 32]),
        };
        let attestations: Vec<Attestation> = keys
            .iter()
            .map(|k| Attestation::sign(k.id(), data, &k.attestation))
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &attestations, |b, batch| {
            b.iter(|| black_box(verify_batch(batch, &registry)))
        });
    }
    group.finish();
}

fn bench_committee_sealing(c: &mut Criterion) {
    let mut group = c.benchmark_group("committee-sealing");
    let seed = [7u8; 32];

    for size in [21usize, 100, 400] {
        let keys = keys(size);
        let registry = registry(&keys);
        let tickets: BTreeMap<_, _> = keys
            .iter()
            .map(|k| (k.id(), evaluate_ticket(&k.vrf, k.id(), 3, &seed)))
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &tickets, |b, tickets| {
            b.iter(|| {
                black_box(EpochAssignment::build(&registry, tickets, 3, seed, 300, 100, 1000))
            })
        });
    }
    group.finish();
}

fn bench_ticket_verification(c: &mut Criterion) {
    let keys = keys(1);
    let registry = registry(&keys);
    let seed = [9u8; 32];
    let ticket = evaluate_ticket(&keys[0].vrf, keys[0].id(), 5, &seed);

    c.bench_function("ticket-verify", |b| {
        b.iter(|| black_box(verify_ticket(&registry, &ticket, &seed)))
    });
}

fn bench_epoch_scoring(c: &mut Criterion) {
    let mut group = c.benchmark_group("epoch-scoring");
    let config = ConsensusConfig::default();
    let scorer = ContributionScorer::new(&config);

    for size in [100usize, 1000] {
        let keys = keys(size);
        let registry = registry(&keys);
        let mut tallies = EpochTallies::new();
        for (i, k) in keys.iter().enumerate() {
            tallies.record_attestation(k.id(), i % 2 == 0, i % 3 == 0, &config.points);
            if i % 10 == 0 {
                tallies.record_proposal(k.id(), &config.points);
            }
        }
        let (ledger, _) = scorer.recompute_epoch(&Default::default(), &registry, &tallies, 0, 100);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &tallies, |b, tallies| {
            b.iter(|| black_box(scorer.recompute_epoch(&ledger, &registry, tallies, 1, 200)))
        });
    }
    group.finish();
}

fn bench_epoch_transition(c: &mut Criterion) {
    let mut group = c.benchmark_group("epoch-transition");
    let config = ConsensusConfig {
        epoch_length: 32,
        ..ConsensusConfig::default()
    };
    let scorer = ContributionScorer::new(&config);

    for size in [100usize, 400] {
        let keys = keys(size);
        let genesis = EpochState::genesis(registry(&keys), &config).expect("active validators");
        let body = BlockBody {
            tickets: keys
                .iter()
                .map(|k| evaluate_ticket(&k.vrf, k.id(), 1, &genesis.next_seed))
                .collect(),
            ..BlockBody::default()
        };
        let segment = EpochSegment {
            epoch: 0,
            checkpoint: [0; 32],
            blocks: vec![SegmentBlock {
                slot: 1,
                proposer: keys[0].id(),
                body: &body,
            }],
        };

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &segment, |b, segment| {
            b.iter(|| black_box(genesis.advance(segment, &config, &scorer)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_attestation_batch,
    bench_committee_sealing,
    bench_ticket_verification,
    bench_epoch_scoring,
    bench_epoch_transition
);
criterion_main!(benches);
