//! # Liveness
//!
//! With more than two thirds of the stake online and honest, every epoch
//! from epoch 2 on finalizes the checkpoint of the previous one.

#[cfg(test)]
mod tests {
    use crate::harness::{sim_config, Simulation};
    use poc_consensus::ConsensusApi;

    #[tokio::test]
    async fn test_one_finalization_per_epoch() {
        let epoch_length = 8;
        let mut sim = Simulation::new(7, sim_config(epoch_length));
        sim.run_to_epoch(2).await;

        for epoch in 2..=6u64 {
            // The last committee position attests at slot start + 6
            sim.run_through(epoch * epoch_length + epoch_length - 1).await;
            let finalized = sim.finalized(0).await;
            assert_eq!(finalized.epoch, epoch - 1, "no finalization in epoch {epoch}");
            assert_eq!(sim.justified(0).await.epoch, epoch);
        }

        let history = sim.finalized_history(0);
        let epochs: Vec<u64> = history.iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_every_slot_gets_a_block() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.run_to_epoch(4).await;

        for slot in 1..=32 {
            assert_eq!(sim.proposals_at(slot).len(), 1, "slot {slot}");
        }
        let head = sim.nodes()[0].service.head().await.unwrap();
        for node in sim.nodes() {
            assert_eq!(node.service.head().await.unwrap(), head);
        }
    }

    #[tokio::test]
    async fn test_progress_with_exactly_three_of_four() {
        let mut sim = Simulation::new(4, sim_config(8));
        sim.run_to_epoch(2).await;
        sim.set_online(0, false);
        sim.run_to_epoch(7).await;

        // 3000 of 4000 stake is still a supermajority
        assert!(sim.finalized(1).await.epoch >= 5);
    }
}
