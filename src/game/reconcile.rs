//! Snapshot reconciliation: compare server truth with buffered predictions,
//! snap and replay when they disagree.

use std::sync::Arc;

use glam::Vec3;
use tracing::{debug, trace, warn};

use super::history::HistoryBuffer;
use super::physics::Simulator;
use super::state::{ActorId, AuthoritativeSnapshot, PhysicalState};
use crate::util::time::Tick;

/// Largest disagreement accepted without a correction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    /// Metres
    pub position: f32,
    /// Radians between orientations
    pub rotation: f32,
    /// Metres per second
    pub linear_velocity: f32,
    /// Radians per second
    pub angular_velocity: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            position: 0.01,
            rotation: 0.01,
            linear_velocity: 0.05,
            angular_velocity: 0.05,
        }
    }
}

/// Per-component difference between two states
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Divergence {
    pub position: f32,
    pub rotation: f32,
    pub linear_velocity: f32,
    pub angular_velocity: f32,
    /// Boost phases differ; never within tolerance
    pub boost_mismatch: bool,
}

impl Divergence {
    pub fn between(a: &PhysicalState, b: &PhysicalState) -> Self {
        Self {
            position: a.position.distance(b.position),
            rotation: a.rotation.angle_between(b.rotation),
            linear_velocity: a.linear_velocity.distance(b.linear_velocity),
            angular_velocity: a.angular_velocity.distance(b.angular_velocity),
            boost_mismatch: a.boost != b.boost,
        }
    }

    pub fn exceeds(&self, tolerance: &Tolerance) -> bool {
        self.boost_mismatch
            || self.position > tolerance.position
            || self.rotation > tolerance.rotation
            || self.linear_velocity > tolerance.linear_velocity
            || self.angular_velocity > tolerance.angular_velocity
    }
}

/// Engine state; `Correcting` only lasts for the duration of one replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    Predicting,
    Correcting,
}

/// What a snapshot did to the local prediction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileOutcome {
    /// Older than anything still buffered
    Stale { tick: Tick },
    /// No local prediction exists for the tick
    MissingRecord { tick: Tick },
    /// Prediction matched within tolerance
    Agreed { tick: Tick, divergence: Divergence },
    /// Snapped to server state and replayed the buffered inputs after it.
    /// `visual_error` is the live position before minus after the correction.
    Corrected {
        tick: Tick,
        divergence: Divergence,
        replayed: usize,
        visual_error: Vec3,
    },
}

impl ReconcileOutcome {
    pub fn is_correction(&self) -> bool {
        matches!(self, Self::Corrected { .. })
    }
}

/// Counters for one engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub snapshots: u64,
    pub stale: u64,
    pub missing: u64,
    pub agreed: u64,
    pub corrections: u64,
    pub replayed_ticks: u64,
    pub anomalies: u64,
}

/// Receives soft anomalies such as persistent divergence
pub trait AnomalySink: Send + Sync {
    fn persistent_divergence(&self, actor_id: ActorId, tick: Tick, streak: u32, divergence: Divergence);
}

/// Default sink: structured warning through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnomalySink;

impl AnomalySink for TracingAnomalySink {
    fn persistent_divergence(&self, actor_id: ActorId, tick: Tick, streak: u32, divergence: Divergence) {
        warn!(
            actor_id = %actor_id,
            tick,
            streak,
            position_error = divergence.position,
            rotation_error = divergence.rotation,
            "Persistent divergence from server state"
        );
    }
}

/// Counts consecutive corrections and reports every `threshold` in a row
pub struct DivergenceMonitor {
    threshold: u32,
    streak: u32,
    sink: Arc<dyn AnomalySink>,
}

impl DivergenceMonitor {
    pub fn new(threshold: u32, sink: Arc<dyn AnomalySink>) -> Self {
        Self {
            threshold: threshold.max(1),
            streak: 0,
            sink,
        }
    }

    /// Returns true when this correction triggered a report
    pub fn record_correction(&mut self, actor_id: ActorId, tick: Tick, divergence: Divergence) -> bool {
        self.streak += 1;
        if self.streak % self.threshold == 0 {
            self.sink
                .persistent_divergence(actor_id, tick, self.streak, divergence);
            true
        } else {
            false
        }
    }

    pub fn record_agreement(&mut self) {
        self.streak = 0;
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

/// Re-run every buffered input after `anchor.tick`, overwriting each record's
/// state. Returns the final state and the number of ticks replayed.
pub fn replay<S: Simulator + ?Sized>(
    sim: &S,
    history: &mut HistoryBuffer,
    anchor: PhysicalState,
    dt: f32,
) -> (PhysicalState, usize) {
    let mut current = anchor;
    let mut steps = 0;
    for record in history.records_from_mut(anchor.tick + 1) {
        current = sim.step(&current, &record.input, dt);
        record.state = current;
        steps += 1;
    }
    (current, steps)
}

/// Client-side snapshot reconciliation for one actor
pub struct ReconciliationEngine {
    actor_id: ActorId,
    tolerance: Tolerance,
    phase: ReconcilePhase,
    monitor: DivergenceMonitor,
    stats: ReconcileStats,
}

impl ReconciliationEngine {
    pub fn new(actor_id: ActorId, tolerance: Tolerance, monitor: DivergenceMonitor) -> Self {
        Self {
            actor_id,
            tolerance,
            phase: ReconcilePhase::Predicting,
            monitor,
            stats: ReconcileStats::default(),
        }
    }

    pub fn phase(&self) -> ReconcilePhase {
        self.phase
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    pub fn tolerance(&self) -> &Tolerance {
        &self.tolerance
    }

    pub fn divergence_streak(&self) -> u32 {
        self.monitor.streak()
    }

    /// Apply one authoritative snapshot to `history` and the live state.
    ///
    /// On divergence the record at the snapshot tick takes the server state,
    /// every later buffered input is replayed through `sim`, and `live`
    /// becomes the replayed head. Anything older than the retained history is
    /// ignored, so duplicate and reordered snapshots cannot move state back.
    pub fn reconcile<S: Simulator + ?Sized>(
        &mut self,
        sim: &S,
        history: &mut HistoryBuffer,
        live: &mut PhysicalState,
        snapshot: &AuthoritativeSnapshot,
        dt: f32,
    ) -> ReconcileOutcome {
        let tick = snapshot.tick();
        self.stats.snapshots += 1;

        let is_stale = history.oldest_tick().map_or(true, |oldest| tick < oldest);
        if is_stale {
            self.stats.stale += 1;
            debug!(actor_id = %self.actor_id, tick, "Discarding stale snapshot");
            return ReconcileOutcome::Stale { tick };
        }

        let Some(record) = history.get(tick) else {
            self.stats.missing += 1;
            debug!(actor_id = %self.actor_id, tick, "No prediction buffered for snapshot tick");
            return ReconcileOutcome::MissingRecord { tick };
        };

        let divergence = Divergence::between(&record.state, &snapshot.state);
        history.truncate_before(tick);

        if !divergence.exceeds(&self.tolerance) {
            self.stats.agreed += 1;
            self.monitor.record_agreement();
            trace!(actor_id = %self.actor_id, tick, "Snapshot agrees with prediction");
            return ReconcileOutcome::Agreed { tick, divergence };
        }

        self.phase = ReconcilePhase::Correcting;
        if let Some(record) = history.get_mut(tick) {
            record.state = snapshot.state;
        }
        let (head, replayed) = replay(sim, history, snapshot.state, dt);
        let visual_error = live.position - head.position;
        *live = head;
        self.phase = ReconcilePhase::Predicting;

        self.stats.corrections += 1;
        self.stats.replayed_ticks += replayed as u64;
        if self.monitor.record_correction(self.actor_id, tick, divergence) {
            self.stats.anomalies += 1;
        }

        debug!(
            actor_id = %self.actor_id,
            tick,
            replayed,
            position_error = divergence.position,
            boost_mismatch = divergence.boost_mismatch,
            "Corrected prediction from snapshot"
        );

        ReconcileOutcome::Corrected {
            tick,
            divergence,
            replayed,
            visual_error,
        }
    }
}
