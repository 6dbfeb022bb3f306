//! # Idempotence
//!
//! Redelivered messages and repeated slot ticks leave state exactly as a
//! single delivery would.

#[cfg(test)]
mod tests {
    use crate::harness::{sim_config, Simulation};
    use poc_consensus::ConsensusApi;

    #[tokio::test]
    async fn test_duplicate_delivery_matches_clean_run() {
        let mut clean = Simulation::new(4, sim_config(8));
        let mut noisy = Simulation::new(4, sim_config(8));
        noisy.set_duplicate_delivery(true);

        clean.run_to_epoch(4).await;
        noisy.run_to_epoch(4).await;

        assert!(noisy.stats.duplicate > 0);
        assert_eq!(clean.stats.duplicate, 0);
        assert_eq!(noisy.stats.accepted, clean.stats.accepted);
        assert!(noisy.stats.slashed.is_empty());

        for i in 0..4 {
            assert_eq!(
                noisy.node(i).service.head().await.unwrap(),
                clean.node(i).service.head().await.unwrap()
            );
            assert_eq!(noisy.finalized(i).await, clean.finalized(i).await);
            assert_eq!(noisy.justified(i).await, clean.justified(i).await);
            assert_eq!(noisy.registry(i).await, clean.registry(i).await);
            assert_eq!(noisy.finalized_history(i), clean.finalized_history(i));
        }
    }

    #[tokio::test]
    async fn test_replaying_gossip_changes_nothing() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.record_history();
        sim.run_through(20).await;

        let registry = sim.registry(0).await;
        let head = sim.node(0).service.head().await.unwrap();
        let finalized = sim.finalized(0).await;
        let accepted = sim.stats.accepted;

        let history = sim.history().to_vec();
        assert!(!history.is_empty());
        for (from, message) in history {
            if from == 0 {
                continue;
            }
            let peer = sim.node(from).peer;
            let _ = sim.inject(0, message, peer).await;
        }

        assert_eq!(sim.stats.accepted, accepted);
        assert!(sim.stats.slashed.is_empty());
        assert_eq!(sim.registry(0).await, registry);
        assert_eq!(sim.node(0).service.head().await.unwrap(), head);
        assert_eq!(sim.finalized(0).await, finalized);
    }
}
