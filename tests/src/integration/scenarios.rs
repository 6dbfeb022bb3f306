//! # End-to-end scenarios
//!
//! - Four equal validators finalize the first epoch checkpoint after two
//!   honest epochs
//! - A validator that goes silent keeps its stake and stake component while
//!   its attestation credit decays away; it is marked Inactive on the way
//! - Validators join and leave at epoch boundaries on every node alike, once
//!   a block carries the registration or exit

#[cfg(test)]
mod tests {
    use crate::harness::{sim_config, validator_id, validator_keys, Simulation, GENESIS_STAKE};
    use poc_consensus::domain::{is_supermajority, CheckpointRef};
    use poc_consensus::{ConsensusApi, ValidatorStatus};
    use shared_types::U256;

    #[tokio::test]
    async fn test_four_validators_finalize_epoch_one() {
        let epoch_length = 10;
        let mut sim = Simulation::new(4, sim_config(epoch_length));
        sim.run_through(3 * epoch_length - 1).await;

        // Exactly one proposer among the four in every slot
        let validators: Vec<_> = (0..4).collect();
        for slot in 1..3 * epoch_length {
            let proposals = sim.proposals_at(slot);
            assert_eq!(proposals.len(), 1, "slot {slot}");
            assert!(validators.contains(&proposals[0].0));
        }

        let epoch_one = CheckpointRef::new(1, sim.proposals_at(epoch_length)[0].1);
        let epoch_two = CheckpointRef::new(2, sim.proposals_at(2 * epoch_length)[0].1);
        for i in 0..4 {
            assert_eq!(sim.finalized(i).await, epoch_one, "node {i}");
            assert_eq!(sim.justified(i).await, epoch_two, "node {i}");

            let records = sim.node(i).store.finalized();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].checkpoint, epoch_one);
            assert_eq!(records[0].total_active_stake, U256::from(4 * GENESIS_STAKE));
            assert!(is_supermajority(
                records[0].attested_stake,
                records[0].total_active_stake
            ));
        }
    }

    #[tokio::test]
    async fn test_silent_validator_decays_to_stake_only() {
        let epoch_length = 4;
        let mut sim = Simulation::new(4, sim_config(epoch_length));
        let silent = validator_id(3);

        // Epoch 1 closes at slot 12 with validator 3 fully active
        sim.run_through(3 * epoch_length).await;
        let before = sim.registry(0).await.get(&silent).unwrap().score;
        assert!(before.attestation > 0);

        sim.set_online(3, false);
        sim.run_to_epoch(106).await;

        let registry = sim.registry(0).await;
        let validator = registry.get(&silent).unwrap();
        assert_eq!(validator.status, ValidatorStatus::Inactive);
        assert_eq!(validator.stake, U256::from(GENESIS_STAKE));
        assert_eq!(validator.score.attestation, 0);
        assert_eq!(validator.score.stake, before.stake);
        assert!(validator.score.total < before.total);
        assert_eq!(registry.total_active_stake(), U256::from(3 * GENESIS_STAKE));

        // The others kept earning and kept finalizing
        let active = registry.get(&validator_id(0)).unwrap().score;
        assert!(active.attestation > 0);
        assert!(sim.finalized(0).await.epoch >= 104);
    }

    #[tokio::test]
    async fn test_lifecycle_changes_apply_at_epoch_boundaries() {
        let epoch_length = 8;
        let mut sim = Simulation::new(4, sim_config(epoch_length));
        sim.run_through(epoch_length + 1).await;

        let newcomer = validator_keys(9);
        let leaver = validator_id(1);
        let id = sim
            .node(0)
            .service
            .register_validator(newcomer.registration(U256::from(GENESIS_STAKE)))
            .await
            .unwrap();
        assert_eq!(id, newcomer.id());
        sim.node(1).service.request_exit(leaver).await.unwrap();

        // Both operations are gossiped, then carried by the next blocks
        sim.deliver().await;
        sim.run_through(epoch_length + 3).await;
        let registry = sim.registry(0).await;
        assert_eq!(registry.get(&leaver).unwrap().exit_requested_epoch, Some(1));
        assert_eq!(
            registry.get(&newcomer.id()).unwrap().status,
            ValidatorStatus::Pending
        );
        assert_eq!(registry.total_active_stake(), U256::from(4 * GENESIS_STAKE));

        sim.run_to_epoch(2).await;
        let registry = sim.registry(0).await;
        assert_eq!(
            registry.get(&newcomer.id()).unwrap().status,
            ValidatorStatus::Active
        );
        assert_eq!(registry.get(&leaver).unwrap().status, ValidatorStatus::Active);
        assert_eq!(registry.total_active_stake(), U256::from(5 * GENESIS_STAKE));

        // Unbonding takes two epochs from the request in epoch 1
        sim.run_to_epoch(3).await;
        let registry = sim.registry(0).await;
        assert_eq!(registry.get(&leaver).unwrap().status, ValidatorStatus::Exiting);
        assert_eq!(registry.total_active_stake(), U256::from(4 * GENESIS_STAKE));
        for i in 1..4 {
            assert_eq!(sim.registry(i).await, registry, "node {i}");
        }

        // An exiting validator no longer enters committees
        sim.run_to_epoch(5).await;
        let committee = sim.node(0).service.committee(5).unwrap();
        assert!(!committee.contains(&leaver));
    }
}
