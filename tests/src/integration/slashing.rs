//! # Slashing
//!
//! Equivocation is detected from gossip or accepted as submitted evidence,
//! spread to every node, carried by the next block, and punished exactly
//! once.

#[cfg(test)]
mod tests {
    use crate::harness::{
        assert_no_conflicting_finality, sim_config, validator_id, validator_keys, Simulation,
    };
    use poc_consensus::domain::{AttestationData, CheckpointRef, OffenseKind};
    use poc_consensus::{
        Attestation, Block, BlockBody, ConsensusApi, MessageOutcome, NetworkMessage,
        SlashingEvidence, ValidatorStatus,
    };
    use shared_types::U256;

    fn vote(index: usize, slot: u64, source: CheckpointRef, target: CheckpointRef) -> Attestation {
        let keys = validator_keys(index);
        Attestation::sign(
            keys.id(),
            AttestationData {
                slot,
                source,
                target,
            },
            &keys.attestation,
        )
    }

    #[tokio::test]
    async fn test_double_sign_detected_from_gossip_and_slashed_once() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.run_through(9).await;

        let (offender, genuine) = sim.proposals_at(9)[0];
        let parent = sim.node(offender).service.head().await.unwrap();
        assert_eq!(parent, genuine);
        let keys = validator_keys(offender);
        let conflicting =
            Block::sign(&keys.signing, keys.id(), 9, parent, [0xEE; 32], BlockBody::default()).unwrap();
        let witness = (offender + 1) % 4;

        let outcome = sim
            .inject(
                witness,
                NetworkMessage::Proposal(conflicting.clone()),
                sim.node(offender).peer,
            )
            .await
            .unwrap();
        assert_eq!(outcome, MessageOutcome::Slashed(keys.id()));
        sim.deliver().await;
        assert!(sim.node(0).store.slashings().is_empty());

        // Slot 10's block carries the evidence
        sim.run_through(10).await;
        for i in 0..4 {
            let registry = sim.registry(i).await;
            let validator = registry.get(&keys.id()).unwrap();
            assert_eq!(validator.status, ValidatorStatus::Slashed);
            assert_eq!(validator.stake, U256::zero());
            assert_eq!(registry.burned(), U256::from(1000u64));

            let slashings = sim.node(i).store.slashings();
            assert_eq!(slashings.len(), 1, "node {i}");
            assert_eq!(slashings[0].kind, OffenseKind::DoubleSign);
            assert_eq!(slashings[0].reporter, None);
        }

        // The same conflict seen again by another node changes nothing
        let other = (offender + 2) % 4;
        let _ = sim
            .inject(other, NetworkMessage::Proposal(conflicting), sim.node(offender).peer)
            .await;
        sim.deliver().await;
        assert_eq!(sim.node(other).store.slashings().len(), 1);

        // The remaining 3000 stake keeps finalizing
        sim.run_to_epoch(4).await;
        let survivors: Vec<usize> = (0..4).filter(|&i| i != offender).collect();
        for &i in &survivors {
            assert!(sim.finalized(i).await.epoch >= 2, "node {i}");
            assert_no_conflicting_finality(
                &sim.finalized_history(i),
                &sim.finalized_history(survivors[0]),
            );
        }
    }

    #[tokio::test]
    async fn test_submitted_double_vote_rewards_reporter() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.run_through(9).await;

        let source = CheckpointRef::new(0, [0; 32]);
        let evidence = SlashingEvidence::DoubleVote {
            a: vote(2, 9, source, CheckpointRef::new(1, [1; 32])),
            b: vote(2, 9, source, CheckpointRef::new(1, [2; 32])),
        };
        let reporter = validator_id(0);

        assert!(sim
            .node(0)
            .service
            .submit_evidence(evidence.clone(), Some(reporter))
            .await
            .unwrap());
        assert!(!sim
            .node(0)
            .service
            .submit_evidence(evidence, Some(reporter))
            .await
            .unwrap());

        sim.deliver().await;
        sim.run_through(10).await;
        let slashings = sim.node(0).store.slashings();
        assert_eq!(slashings.len(), 1);
        let record = &slashings[0];
        assert_eq!(record.kind, OffenseKind::DoubleVote);
        assert_eq!(record.reporter, Some(reporter));
        assert_eq!(record.penalty, U256::from(1000u64));
        assert_eq!(record.reporter_reward, U256::from(100u64));
        assert_eq!(record.burned, U256::from(900u64));

        let registry = sim.registry(0).await;
        assert_eq!(registry.get(&reporter).unwrap().stake, U256::from(1100u64));
        for i in 1..4 {
            assert_eq!(sim.registry(i).await, registry, "node {i}");
            assert_eq!(sim.node(i).store.slashings().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_surround_vote_takes_half_the_stake() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.run_through(9).await;

        let evidence = SlashingEvidence::SurroundVote {
            a: vote(3, 40, CheckpointRef::new(1, [1; 32]), CheckpointRef::new(5, [5; 32])),
            b: vote(3, 24, CheckpointRef::new(2, [2; 32]), CheckpointRef::new(3, [3; 32])),
        };
        assert!(sim
            .node(1)
            .service
            .submit_evidence(evidence, None)
            .await
            .unwrap());
        sim.deliver().await;
        sim.run_through(10).await;

        let slashings = sim.node(1).store.slashings();
        assert_eq!(slashings.len(), 1);
        let record = &slashings[0];
        assert_eq!(record.kind, OffenseKind::SurroundVote);
        assert_eq!(record.penalty, U256::from(500u64));
        assert_eq!(record.reporter_reward, U256::zero());

        let registry = sim.registry(1).await;
        let offender = registry.get(&validator_id(3)).unwrap();
        assert_eq!(offender.status, ValidatorStatus::Slashed);
        assert_eq!(offender.stake, U256::from(500u64));
    }

    #[tokio::test]
    async fn test_evidence_without_conflict_is_rejected() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.run_through(9).await;

        let source = CheckpointRef::new(0, [0; 32]);
        let same = vote(1, 9, source, CheckpointRef::new(1, [1; 32]));
        let evidence = SlashingEvidence::DoubleVote {
            a: same.clone(),
            b: same,
        };
        assert!(sim
            .node(0)
            .service
            .submit_evidence(evidence, Some(validator_id(0)))
            .await
            .is_err());

        let registry = sim.registry(0).await;
        assert_eq!(
            registry.get(&validator_id(1)).unwrap().status,
            ValidatorStatus::Active
        );
        assert!(sim.node(0).store.slashings().is_empty());
    }
}
