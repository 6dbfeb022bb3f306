//! # Safety
//!
//! No two nodes may ever finalize different blocks for the same epoch,
//! whatever the delivery order or network split.

#[cfg(test)]
mod tests {
    use crate::harness::{assert_no_conflicting_finality, sim_config, Simulation};

    async fn assert_pairwise_consistent(sim: &Simulation) {
        let count = sim.nodes().len();
        for a in 0..count {
            for b in (a + 1)..count {
                assert_no_conflicting_finality(&sim.finalized_history(a), &sim.finalized_history(b));
            }
        }
    }

    #[tokio::test]
    async fn test_all_nodes_agree_on_finalized_checkpoints() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.run_to_epoch(5).await;

        assert_pairwise_consistent(&sim).await;
        let reference = sim.finalized(0).await;
        assert!(reference.epoch >= 3);
        for i in 1..4 {
            assert_eq!(sim.finalized(i).await, reference);
            assert_eq!(sim.finalized_history(i), sim.finalized_history(0));
        }
    }

    #[tokio::test]
    async fn test_shuffled_delivery_never_conflicts() {
        for seed in [1u64, 7, 99] {
            let mut sim = Simulation::new(5, sim_config(6));
            sim.shuffle_delivery(seed);
            sim.run_to_epoch(5).await;

            assert_pairwise_consistent(&sim).await;
            assert!(sim.finalized(0).await.epoch >= 2, "seed {seed} stalled");
        }
    }

    #[tokio::test]
    async fn test_even_partition_stalls_finality() {
        let mut sim = Simulation::new(4, sim_config(8));
        // Through the end of epoch 2: epoch 2 justified, epoch 1 finalized
        sim.run_through(3 * 8 - 1).await;
        let before = sim.finalized(0).await;
        assert_eq!(before.epoch, 1);

        sim.partition(&[&[0, 1], &[2, 3]]);
        sim.run_to_epoch(8).await;

        assert_pairwise_consistent(&sim).await;
        for i in 0..4 {
            assert_eq!(sim.finalized(i).await, before, "node {i} finalized during split");
            assert_eq!(sim.justified(i).await.epoch, 2);
        }
    }

    #[tokio::test]
    async fn test_minority_offline_keeps_finalizing() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.set_online(3, false);
        sim.run_to_epoch(5).await;

        assert_pairwise_consistent(&sim).await;
        for i in 0..3 {
            assert!(sim.finalized(i).await.epoch >= 3);
        }
    }
}
