//! Client-side session: sample, send, predict, reconcile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::SimConfig;
use crate::game::actor::{ActorView, PredictedActor};
use crate::game::physics::{DriveModel, Simulator};
use crate::game::reconcile::{AnomalySink, ReconcileOutcome};
use crate::game::state::{ActionFlags, ActorId, AuthoritativeSnapshot, InputFrame};
use crate::game::world::SpawnInfo;
use crate::net::NetChannel;
use crate::util::time::{Tick, TickClock};
use crate::ws::protocol::{InputMessage, SnapshotMessage};

/// Produces the control intent for a tick; never fails
pub trait InputSampler {
    fn sample(&mut self, tick: Tick) -> InputFrame;
}

/// Always neutral, for spectators and idle bots
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralSampler;

impl InputSampler for NeutralSampler {
    fn sample(&mut self, tick: Tick) -> InputFrame {
        InputFrame::neutral(tick)
    }
}

impl<F> InputSampler for F
where
    F: FnMut(Tick) -> InputFrame,
{
    fn sample(&mut self, tick: Tick) -> InputFrame {
        self(tick)
    }
}

/// Raw device reading: axes in `[-1, 1]`, buttons held
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceState {
    pub vertical: f32,
    pub horizontal: f32,
    pub boost: bool,
    pub jump: bool,
}

/// Samples whatever the device thread last wrote into a shared slot
#[derive(Debug, Clone, Default)]
pub struct DeviceSampler {
    slot: Arc<Mutex<Option<DeviceState>>>,
}

impl DeviceSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared slot for the device thread to write into
    pub fn slot(&self) -> Arc<Mutex<Option<DeviceState>>> {
        self.slot.clone()
    }

    pub fn set(&self, state: DeviceState) {
        *self.slot.lock() = Some(state);
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

impl InputSampler for DeviceSampler {
    fn sample(&mut self, tick: Tick) -> InputFrame {
        let Some(device) = *self.slot.lock() else {
            return InputFrame::neutral(tick);
        };

        let mut actions = ActionFlags::NONE;
        if device.boost {
            actions.insert(ActionFlags::BOOST);
        }
        if device.jump {
            actions.insert(ActionFlags::JUMP);
        }
        InputFrame::new(tick, device.vertical, device.horizontal, actions)
    }
}

/// One controlling client: owns the predicted actor, a transport and an
/// input source, and tracks the latest state of every other actor.
pub struct ClientSession<C, I, S = DriveModel> {
    actor: PredictedActor<S>,
    sampler: I,
    channel: C,
    clock: TickClock,
    remotes: HashMap<ActorId, AuthoritativeSnapshot>,
    last_outcome: Option<ReconcileOutcome>,
    send_failures: u64,
}

impl<C, I, S> ClientSession<C, I, S>
where
    C: NetChannel<Outgoing = InputMessage, Incoming = SnapshotMessage>,
    I: InputSampler,
    S: Simulator,
{
    pub fn new(actor: PredictedActor<S>, sampler: I, channel: C, tick_rate: u32, now: Instant) -> Self {
        let clock = TickClock::new(actor.current_tick(), tick_rate, now);
        Self {
            actor,
            sampler,
            channel,
            clock,
            remotes: HashMap::new(),
            last_outcome: None,
            send_failures: 0,
        }
    }

    /// Start predicting from the spawn state the server handed out
    pub fn from_spawn(
        spawn: &SpawnInfo,
        sim: S,
        sampler: I,
        channel: C,
        config: &SimConfig,
        sink: Arc<dyn AnomalySink>,
        now: Instant,
    ) -> Self {
        let actor = PredictedActor::new(
            spawn.actor_id,
            sim,
            spawn.snapshot.to_snapshot().state,
            config,
            sink,
        );
        Self::new(actor, sampler, channel, config.tick_rate, now)
    }

    /// Run every tick that became due by `now`. Returns how many ran.
    pub fn update(&mut self, now: Instant) -> usize {
        let due = self.clock.advance(now);
        let mut ran = 0;
        for _ in due {
            self.step();
            ran += 1;
        }
        ran
    }

    /// Predict `ticks` ticks immediately so inputs reach the server before
    /// it simulates them. The tick clock keeps its schedule.
    pub fn run_ahead(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Run exactly one tick: reconcile anything received, then sample,
    /// send and predict the next tick.
    pub fn step(&mut self) -> Tick {
        self.drain_snapshots();

        let tick = self.actor.current_tick() + 1;
        let mut input = self.sampler.sample(tick);
        input.tick = tick;

        if let Err(err) = self
            .channel
            .send(InputMessage::from_frame(self.actor.id(), &input))
        {
            self.send_failures += 1;
            debug!(actor_id = %self.actor.id(), tick, error = %err, "Input send failed");
        }

        self.actor.predict(input);
        tick
    }

    fn drain_snapshots(&mut self) {
        while let Some(message) = self.channel.try_recv() {
            let snapshot = message.to_snapshot();
            if snapshot.actor_id == self.actor.id() {
                self.last_outcome = Some(self.actor.apply_snapshot(&snapshot));
                continue;
            }

            // Observed actors only ever move forward in time
            match self.remotes.get(&snapshot.actor_id) {
                Some(known) if known.tick() >= snapshot.tick() => {
                    trace!(actor_id = %snapshot.actor_id, tick = snapshot.tick(), "Old remote snapshot");
                }
                _ => {
                    self.remotes.insert(snapshot.actor_id, snapshot);
                }
            }
        }
    }

    pub fn actor(&self) -> &PredictedActor<S> {
        &self.actor
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Latest known server state of another actor
    pub fn remote(&self, actor_id: &ActorId) -> Option<&AuthoritativeSnapshot> {
        self.remotes.get(actor_id)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &AuthoritativeSnapshot> + '_ {
        self.remotes.values()
    }

    /// Forget an actor the server reported as despawned
    pub fn forget_remote(&mut self, actor_id: &ActorId) {
        self.remotes.remove(actor_id);
    }

    pub fn last_outcome(&self) -> Option<ReconcileOutcome> {
        self.last_outcome
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }
}

impl<C, I> ClientSession<C, I, DriveModel> {
    pub fn view(&self) -> ActorView {
        self.actor.view()
    }
}
