//! Snapshot cadence and assembly

use crate::util::time::Tick;
use crate::ws::protocol::{ServerMsg, SnapshotMessage};

use super::actor::AuthoritativeActor;

/// Decides when to broadcast and builds the snapshot batch
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    pub fn interval(&self) -> u32 {
        self.snapshot_interval
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used after a spawn)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// One message carrying every actor's state at `tick`, in iteration order
    pub fn build<'a>(
        &self,
        tick: Tick,
        actors: impl IntoIterator<Item = &'a AuthoritativeActor>,
    ) -> ServerMsg {
        ServerMsg::Snapshot {
            tick,
            actors: actors
                .into_iter()
                .map(|actor| SnapshotMessage::from_snapshot(&actor.snapshot()))
                .collect(),
        }
    }
}

/// Snapshot traffic counters for debugging
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub avg_actors_per_snapshot: f32,
}

impl SnapshotStats {
    pub fn record(&mut self, actor_count: usize) {
        self.total_snapshots += 1;

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_actors_per_snapshot =
            self.avg_actors_per_snapshot * ((n - 1.0) / n) + (actor_count as f32 / n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::PhysicalState;
    use glam::Vec3;
    use uuid::Uuid;

    #[test]
    fn sends_every_interval() {
        let mut builder = SnapshotBuilder::new(3);
        let sent: Vec<bool> = (0..6).map(|_| builder.should_send()).collect();
        assert_eq!(sent, vec![false, false, true, false, false, true]);

        builder.force_next();
        assert!(builder.should_send());
    }

    #[test]
    fn build_includes_every_actor() {
        let actors = [
            AuthoritativeActor::new(Uuid::new_v4(), Uuid::new_v4(), PhysicalState::at_rest(4, Vec3::ZERO, 0.0), 8),
            AuthoritativeActor::new(Uuid::new_v4(), Uuid::new_v4(), PhysicalState::at_rest(4, Vec3::X, 0.0), 8),
        ];

        let ServerMsg::Snapshot { tick, actors: batch } = SnapshotBuilder::new(1).build(4, &actors) else {
            panic!("expected snapshot");
        };
        assert_eq!(tick, 4);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].position, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn stats_average_actor_count() {
        let mut stats = SnapshotStats::default();
        stats.record(2);
        stats.record(4);
        assert_eq!(stats.total_snapshots, 2);
        assert!((stats.avg_actors_per_snapshot - 3.0).abs() < 1e-5);
    }
}
