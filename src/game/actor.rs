//! Per-actor simulation wrappers for both peers.
//!
//! [`PredictedActor`] runs on the controlling client and reconciles its own
//! predictions against snapshots. [`AuthoritativeActor`] runs on the server,
//! schedules inputs by tick and re-derives history when an input arrives late.

use std::collections::BTreeMap;
use std::sync::Arc;

use glam::{Quat, Vec3};
use tracing::debug;
use uuid::Uuid;

use super::history::HistoryBuffer;
use super::physics::{BoostPhase, DriveModel, DriveStatus, Simulator};
use super::reconcile::{
    replay, AnomalySink, DivergenceMonitor, ReconcileOutcome, ReconcileStats, ReconciliationEngine,
};
use super::smoothing::SmoothCorrection;
use super::state::{ActorId, AuthoritativeSnapshot, InputFrame, PhysicalState};
use crate::config::SimConfig;
use crate::util::time::Tick;

/// Read-only view handed to renderers, cameras and effects
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActorView {
    pub actor_id: ActorId,
    pub state: PhysicalState,
    pub render_position: Vec3,
    pub render_rotation: Quat,
    pub boost: BoostPhase,
}

impl DriveStatus for ActorView {
    fn boost_phase(&self) -> BoostPhase {
        self.boost
    }
}

/// Locally controlled actor: predicts every tick, reconciles on snapshots
pub struct PredictedActor<S = DriveModel> {
    id: ActorId,
    sim: S,
    dt: f32,
    state: PhysicalState,
    history: HistoryBuffer,
    engine: ReconciliationEngine,
    smoothing: SmoothCorrection,
}

impl<S: Simulator> PredictedActor<S> {
    /// `spawn` becomes the first history record so that a snapshot for the
    /// spawn tick can anchor a replay.
    pub fn new(
        id: ActorId,
        sim: S,
        spawn: PhysicalState,
        config: &SimConfig,
        sink: Arc<dyn AnomalySink>,
    ) -> Self {
        let mut history = HistoryBuffer::new(config.history_capacity);
        history.record(InputFrame::neutral(spawn.tick), spawn);

        Self {
            id,
            sim,
            dt: config.dt(),
            state: spawn,
            history,
            engine: ReconciliationEngine::new(
                id,
                config.tolerance,
                DivergenceMonitor::new(config.divergence_streak, sink),
            ),
            smoothing: SmoothCorrection::new(config.correction_smoothing_secs),
        }
    }

    /// Simulate the next tick with `input` and buffer the result.
    ///
    /// The input's tick is forced to the next tick so the buffer stays
    /// contiguous.
    pub fn predict(&mut self, mut input: InputFrame) -> &PhysicalState {
        input.tick = self.state.tick + 1;
        let next = self.sim.step(&self.state, &input, self.dt);
        self.history.record(input, next);
        self.state = next;
        self.smoothing.update(self.dt);
        &self.state
    }

    /// Reconcile against server truth for this actor.
    ///
    /// Corrections snap the physics state; the render pose eases from where
    /// the car was drawn.
    pub fn apply_snapshot(&mut self, snapshot: &AuthoritativeSnapshot) -> ReconcileOutcome {
        let (shown_position, shown_rotation) = self.render_pose();
        let outcome =
            self.engine
                .reconcile(&self.sim, &mut self.history, &mut self.state, snapshot, self.dt);

        if outcome.is_correction() {
            self.smoothing.start(
                shown_position,
                shown_rotation,
                self.state.position,
                self.state.rotation,
            );
        }
        outcome
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn state(&self) -> &PhysicalState {
        &self.state
    }

    pub fn current_tick(&self) -> Tick {
        self.state.tick
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn stats(&self) -> ReconcileStats {
        self.engine.stats()
    }

    pub fn simulator(&self) -> &S {
        &self.sim
    }

    /// Physics pose with any pending correction offset applied
    pub fn render_pose(&self) -> (Vec3, Quat) {
        self.smoothing.apply(self.state.position, self.state.rotation)
    }
}

impl PredictedActor<DriveModel> {
    pub fn view(&self) -> ActorView {
        let (render_position, render_rotation) = self.render_pose();
        ActorView {
            actor_id: self.id,
            state: self.state,
            render_position,
            render_rotation,
            boost: self.boost_phase(),
        }
    }
}

impl DriveStatus for PredictedActor<DriveModel> {
    fn boost_phase(&self) -> BoostPhase {
        self.sim.boost_phase(self.state.boost)
    }
}

/// What the server did with one received input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    /// Queued for a tick not simulated yet
    Scheduled,
    /// Applied to an already simulated tick; history re-derived from `from`
    Rewound { from: Tick, replayed: usize },
    /// Same input already queued or applied
    Duplicate,
    /// Tick no longer buffered
    Stale,
    /// Tick too far ahead of the server
    TooEarly,
}

/// Server-side actor. Its state is the truth broadcast to every peer.
#[derive(Debug, Clone)]
pub struct AuthoritativeActor {
    id: ActorId,
    owner: Uuid,
    state: PhysicalState,
    history: HistoryBuffer,
    pending: BTreeMap<Tick, InputFrame>,
}

impl AuthoritativeActor {
    pub fn new(id: ActorId, owner: Uuid, spawn: PhysicalState, history_capacity: usize) -> Self {
        let mut history = HistoryBuffer::new(history_capacity);
        history.record(InputFrame::neutral(spawn.tick), spawn);
        Self {
            id,
            owner,
            state: spawn,
            history,
            pending: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn state(&self) -> &PhysicalState {
        &self.state
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn pending_inputs(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot(&self) -> AuthoritativeSnapshot {
        AuthoritativeSnapshot {
            actor_id: self.id,
            state: self.state,
        }
    }

    /// Accept an input stamped for any tick.
    ///
    /// Future ticks are queued. A tick the server already simulated replaces
    /// the input used there and every later tick is re-simulated, so the
    /// final state does not depend on arrival order.
    pub fn receive_input<S: Simulator + ?Sized>(
        &mut self,
        sim: &S,
        frame: InputFrame,
        dt: f32,
    ) -> InputDisposition {
        let current = self.state.tick;

        if frame.tick > current {
            if frame.tick - current > self.history.capacity() as Tick {
                return InputDisposition::TooEarly;
            }
            return match self.pending.insert(frame.tick, frame) {
                Some(previous) if previous == frame => InputDisposition::Duplicate,
                _ => InputDisposition::Scheduled,
            };
        }

        let anchor = frame
            .tick
            .checked_sub(1)
            .and_then(|previous| self.history.get(previous))
            .map(|record| record.state);
        let Some(anchor) = anchor else {
            return InputDisposition::Stale;
        };

        match self.history.get(frame.tick) {
            Some(record) if record.input == frame => return InputDisposition::Duplicate,
            Some(_) => {}
            None => return InputDisposition::Stale,
        }

        self.history.replace_input(frame.tick, frame);
        let (head, replayed) = replay(sim, &mut self.history, anchor, dt);
        self.state = head;

        debug!(actor_id = %self.id, tick = frame.tick, replayed, "Re-derived state for late input");
        InputDisposition::Rewound {
            from: frame.tick,
            replayed,
        }
    }

    /// Simulate one tick with the queued input for it, or neutral if none
    /// arrived.
    pub fn advance<S: Simulator + ?Sized>(&mut self, sim: &S, dt: f32) -> &PhysicalState {
        let tick = self.state.tick + 1;
        let input = self
            .pending
            .remove(&tick)
            .unwrap_or_else(|| InputFrame::neutral(tick));

        // queued frames can only be left behind by a clock jump
        self.pending = self.pending.split_off(&tick);

        let next = sim.step(&self.state, &input, dt);
        self.history.record(input, next);
        self.state = next;
        &self.state
    }
}
