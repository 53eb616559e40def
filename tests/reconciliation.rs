//! Client/server agreement scenarios driven tick by tick without a runtime.

use std::sync::Arc;

use car_sync_server::config::SimConfig;
use car_sync_server::game::reconcile::replay;
use car_sync_server::game::{
    ActionFlags, AuthoritativeActor, AuthoritativeSnapshot, DriveModel, HistoryBuffer, InputDisposition,
    InputFrame, PhysicalState, PredictedActor, ReconcileOutcome, Simulator, TracingAnomalySink,
};
use car_sync_server::util::time::Tick;
use glam::Vec3;
use uuid::Uuid;

const SPAWN_TICK: Tick = 100;

fn config() -> SimConfig {
    SimConfig::default()
}

fn spawn_state() -> PhysicalState {
    PhysicalState::at_rest(SPAWN_TICK, Vec3::new(5.0, 0.0, -3.0), 0.3)
}

/// Full throttle with a gentle left turn
fn driving(tick: Tick) -> InputFrame {
    InputFrame::new(tick, 1.0, -0.3, ActionFlags::NONE)
}

struct Pair {
    client: PredictedActor,
    server: AuthoritativeActor,
    model: DriveModel,
    dt: f32,
}

impl Pair {
    fn new() -> Self {
        let config = config();
        let id = Uuid::new_v4();
        Self {
            client: PredictedActor::new(
                id,
                DriveModel::default(),
                spawn_state(),
                &config,
                Arc::new(TracingAnomalySink),
            ),
            server: AuthoritativeActor::new(id, Uuid::new_v4(), spawn_state(), config.history_capacity),
            model: DriveModel::default(),
            dt: config.dt(),
        }
    }

    /// Client predicts `tick`; the server receives the input unless `lost`,
    /// then simulates the same tick.
    fn run_tick(&mut self, input: InputFrame, lost: bool) {
        self.client.predict(input);
        if !lost {
            self.server.receive_input(&self.model, input, self.dt);
        }
        self.server.advance(&self.model, self.dt);
    }

    fn server_snapshot_at(&self, tick: Tick) -> AuthoritativeSnapshot {
        let state = self
            .server
            .history()
            .get(tick)
            .map(|record| record.state)
            .expect("server tick buffered");
        AuthoritativeSnapshot {
            actor_id: self.server.id(),
            state,
        }
    }
}

#[test]
fn agreeing_snapshot_leaves_prediction_untouched() {
    let mut pair = Pair::new();
    for tick in 101..=110 {
        pair.run_tick(driving(tick), false);
    }
    let before = *pair.client.state();

    let snapshot = pair.server_snapshot_at(105);
    let outcome = pair.client.apply_snapshot(&snapshot);

    assert!(matches!(outcome, ReconcileOutcome::Agreed { tick: 105, .. }));
    assert_eq!(*pair.client.state(), before);
    assert_eq!(pair.client.stats().corrections, 0);
    assert_eq!(pair.client.history().oldest_tick(), Some(105));
}

#[test]
fn lost_input_is_corrected_by_snap_and_replay() {
    let mut pair = Pair::new();
    for tick in 101..=110 {
        pair.run_tick(driving(tick), tick == 103);
    }

    let snapshot = pair.server_snapshot_at(103);
    let outcome = pair.client.apply_snapshot(&snapshot);

    let ReconcileOutcome::Corrected { tick, replayed, divergence, .. } = outcome else {
        panic!("expected a correction, got {outcome:?}");
    };
    assert_eq!(tick, 103);
    assert_eq!(replayed, 7);
    assert!(divergence.linear_velocity > 0.0);

    // Replaying 104..=110 from server truth lands exactly where the server is
    assert_eq!(pair.client.state(), pair.server.state());
    for tick in 103..=110 {
        assert_eq!(
            pair.client.history().get(tick).map(|r| r.state),
            pair.server.history().get(tick).map(|r| r.state),
        );
    }
}

#[test]
fn server_result_is_independent_of_arrival_order() {
    let model = DriveModel::default();
    let dt = config().dt();
    let inputs = [
        InputFrame::new(101, 1.0, 0.0, ActionFlags::NONE),
        InputFrame::new(102, 1.0, 0.8, ActionFlags::JUMP),
        InputFrame::new(103, -0.5, -1.0, ActionFlags::NONE),
    ];

    let mut in_order = AuthoritativeActor::new(Uuid::new_v4(), Uuid::new_v4(), spawn_state(), 64);
    for input in inputs {
        in_order.receive_input(&model, input, dt);
    }
    for _ in 0..3 {
        in_order.advance(&model, dt);
    }

    // 101 and 103 arrive first, the server runs all three ticks, then 102 shows up
    let mut shuffled = AuthoritativeActor::new(Uuid::new_v4(), Uuid::new_v4(), spawn_state(), 64);
    shuffled.receive_input(&model, inputs[0], dt);
    shuffled.receive_input(&model, inputs[2], dt);
    for _ in 0..3 {
        shuffled.advance(&model, dt);
    }
    let late = shuffled.receive_input(&model, inputs[1], dt);

    assert_eq!(late, InputDisposition::Rewound { from: 102, replayed: 2 });
    assert_eq!(shuffled.state(), in_order.state());
}

#[test]
fn stale_snapshot_is_discarded() {
    let mut pair = Pair::new();
    for tick in 101..=110 {
        pair.run_tick(driving(tick), false);
    }
    let agreeing = pair.server_snapshot_at(106);
    pair.client.apply_snapshot(&agreeing);
    let before = *pair.client.state();

    let mut old = pair.server_snapshot_at(104);
    old.state.position += Vec3::splat(10.0);
    let outcome = pair.client.apply_snapshot(&old);

    assert_eq!(outcome, ReconcileOutcome::Stale { tick: 104 });
    assert_eq!(*pair.client.state(), before);
}

#[test]
fn duplicate_snapshots_are_idempotent() {
    let mut pair = Pair::new();
    for tick in 101..=110 {
        pair.run_tick(driving(tick), tick == 104);
    }
    let snapshot = pair.server_snapshot_at(104);

    assert!(pair.client.apply_snapshot(&snapshot).is_correction());
    let corrected = *pair.client.state();

    assert!(matches!(pair.client.apply_snapshot(&snapshot), ReconcileOutcome::Agreed { .. }));
    assert_eq!(*pair.client.state(), corrected);
}

#[test]
fn replay_is_deterministic() {
    let model = DriveModel::default();
    let dt = config().dt();
    let anchor = spawn_state();

    let mut history = HistoryBuffer::new(64);
    history.record(InputFrame::neutral(SPAWN_TICK), anchor);
    let mut live = anchor;
    for tick in 101..=140 {
        let actions = if tick % 7 == 0 { ActionFlags::BOOST } else { ActionFlags::NONE };
        let input = InputFrame::new(tick, 0.9, ((tick as f32) * 0.3).sin(), actions);
        live = model.step(&live, &input, dt);
        history.record(input, live);
    }

    let (first, steps) = replay(&model, &mut history, anchor, dt);
    let (second, _) = replay(&model, &mut history, anchor, dt);

    assert_eq!(steps, 40);
    assert_eq!(first, live);
    assert_eq!(second, first);
}

#[test]
fn every_snapshot_agrees_when_nothing_is_lost() {
    let mut pair = Pair::new();
    for tick in 101..=160 {
        let turn = if tick < 130 { 0.6 } else { -0.6 };
        pair.run_tick(InputFrame::new(tick, 1.0, turn, ActionFlags::NONE), false);
        if tick % 3 == 0 {
            let snapshot = pair.server_snapshot_at(tick);
            let outcome = pair.client.apply_snapshot(&snapshot);
            assert!(matches!(outcome, ReconcileOutcome::Agreed { .. }), "tick {tick}: {outcome:?}");
        }
    }

    assert_eq!(pair.client.stats().corrections, 0);
    assert_eq!(pair.client.state(), pair.server.state());
}
