//! # Determinism
//!
//! Nodes holding the same blocks derive the same committees, scores and
//! registry, whatever gossip each one missed; two runs from the same genesis
//! produce the same chain.

#[cfg(test)]
mod tests {
    use crate::harness::{sim_config, validator_id, Simulation, GENESIS_STAKE};
    use poc_consensus::domain::{is_supermajority, MessageKind};
    use poc_consensus::{ConsensusApi, ValidatorStatus};
    use shared_types::U256;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn test_nodes_derive_identical_committees_and_scores() {
        let mut sim = Simulation::new(5, sim_config(6));
        for epoch in 0..=6 {
            sim.run_to_epoch(epoch).await;
            let reference = sim.node(0).service.committee(epoch).expect("head-chain committee");
            assert_eq!(reference.len(), 5);
            for node in &sim.nodes()[1..] {
                assert_eq!(node.service.committee(epoch).as_ref(), Some(&reference));
            }
        }

        let registry = sim.registry(0).await;
        for i in 1..5 {
            assert_eq!(sim.registry(i).await, registry, "node {i} registry diverged");
        }

        // Epoch e closes once votes for it can no longer be included
        let updates = sim.node(0).store.epoch_updates();
        assert_eq!(updates.len(), 5);
        for node in &sim.nodes()[1..] {
            let other = node.store.epoch_updates();
            assert_eq!(other.len(), updates.len());
            for (a, b) in updates.iter().zip(&other) {
                assert_eq!(a.epoch, b.epoch);
                assert_eq!(a.scores, b.scores);
                assert_eq!(a.recorded, b.recorded);
                assert_eq!(a.statuses, b.statuses);
            }
        }
    }

    #[tokio::test]
    async fn test_scores_reflect_contributions() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.run_to_epoch(3).await;

        // Epochs 0 and 1 are closed; every block of a single honest chain is canonical
        let proposers: BTreeSet<usize> = (1..16)
            .flat_map(|slot| sim.proposals_at(slot).iter().map(|(node, _)| *node))
            .collect();
        let registry = sim.registry(0).await;
        for i in 0..4 {
            let score = registry.get(&validator_id(i)).unwrap().score;
            assert!(score.attestation > 0, "validator {i} has no attestation credit");
            assert_eq!(score.production > 0, proposers.contains(&i));
            assert_eq!(score.relay, 0);
            assert!(score.total > 0);
        }
    }

    #[tokio::test]
    async fn test_repeated_runs_build_the_same_chain() {
        let mut first = Simulation::new(4, sim_config(8));
        let mut second = Simulation::new(4, sim_config(8));
        first.run_to_epoch(3).await;
        second.run_to_epoch(3).await;

        assert_eq!(
            first.node(0).service.head().await.unwrap(),
            second.node(0).service.head().await.unwrap()
        );
        assert_eq!(first.finalized(0).await, second.finalized(0).await);
        assert_eq!(first.registry(0).await, second.registry(0).await);
    }

    #[tokio::test]
    async fn test_missed_ticket_gossip_leaves_committees_identical() {
        let epoch_length = 6;
        let mut sim = Simulation::new(5, sim_config(epoch_length));
        sim.drop_incoming(4, MessageKind::Ticket);

        for epoch in 1..=6 {
            sim.run_to_epoch(epoch).await;
            let reference = sim.node(0).service.committee(epoch).unwrap();
            let attesters = sim.node(0).service.attesters(epoch).unwrap();
            for node in &sim.nodes()[1..] {
                assert_eq!(node.service.committee(epoch), Some(reference.clone()), "epoch {epoch}");
                assert_eq!(node.service.attesters(epoch), Some(attesters.clone()), "epoch {epoch}");
            }
        }
        sim.run_through(7 * epoch_length - 1).await;

        // One block per slot: node 4 never proposed out of turn
        for slot in 1..7 * epoch_length {
            assert_eq!(sim.proposals_at(slot).len(), 1, "slot {slot}");
        }
        let finalized = sim.finalized(0).await;
        assert!(finalized.epoch >= 5);
        for i in 1..5 {
            assert_eq!(sim.finalized(i).await, finalized, "node {i}");
            assert_eq!(sim.registry(i).await, sim.registry(0).await, "node {i}");
        }
    }

    #[tokio::test]
    async fn test_offline_attesters_go_inactive_and_finality_resumes() {
        let epoch_length = 4;
        let mut sim = Simulation::new(4, sim_config(epoch_length));
        sim.run_through(2 * epoch_length - 1).await;
        assert_eq!(sim.finalized(0).await.epoch, 0);
        sim.set_online(2, false);
        sim.set_online(3, false);

        // Half the stake cannot justify anything
        sim.run_through(8 * epoch_length - 1).await;
        assert!(sim.justified(0).await.epoch <= 1);

        // Epochs 2..=9 missed; epoch 9 closes at the start of epoch 11
        sim.run_through(14 * epoch_length - 1).await;
        let registry = sim.registry(0).await;
        for i in [2, 3] {
            let validator = registry.get(&validator_id(i)).unwrap();
            assert_eq!(validator.status, ValidatorStatus::Inactive, "validator {i}");
            assert!(validator.stake < U256::from(GENESIS_STAKE), "validator {i} was not leaked");
        }
        for i in [0, 1] {
            let validator = registry.get(&validator_id(i)).unwrap();
            assert_eq!(validator.status, ValidatorStatus::Active);
            assert_eq!(validator.stake, U256::from(GENESIS_STAKE));
        }
        assert_eq!(registry.total_active_stake(), U256::from(2 * GENESIS_STAKE));
        assert_eq!(sim.registry(1).await, registry);

        let finalized = sim.finalized(0).await;
        assert!(finalized.epoch >= 11, "finalized {finalized}");
        assert_eq!(sim.finalized(1).await, finalized);
    }

    #[tokio::test]
    async fn test_full_validator_set_attests_beside_smaller_committee() {
        let epoch_length = 8;
        let mut config = sim_config(epoch_length);
        config.committee.size = 21;
        let mut sim = Simulation::new(32, config);
        sim.run_through(3 * epoch_length - 1).await;

        for epoch in 1..=2 {
            let committee = sim.node(0).service.committee(epoch).unwrap();
            let attesters = sim.node(0).service.attesters(epoch).unwrap();
            assert_eq!(committee.len(), 21);
            assert_eq!(attesters.len(), 32);
            assert_eq!(attesters[..21], committee[..]);
        }

        let finalized = sim.finalized(0).await;
        assert_eq!(finalized.epoch, 1);
        let records = sim.node(0).store.finalized();
        assert_eq!(records[0].total_active_stake, U256::from(32 * GENESIS_STAKE));
        assert!(records[0].attested_stake > U256::from(21 * GENESIS_STAKE));
        assert!(is_supermajority(
            records[0].attested_stake,
            records[0].total_active_stake
        ));
        for i in 1..32 {
            assert_eq!(sim.finalized(i).await, finalized, "node {i}");
        }
    }
}
