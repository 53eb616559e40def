//! Server world state and authoritative tick loop

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SimConfig;
use crate::util::time::{Tick, TickClock};
use crate::ws::protocol::{InputMessage, ServerMsg, SnapshotMessage};

use super::actor::{AuthoritativeActor, InputDisposition};
use super::physics::DriveModel;
use super::snapshot::{SnapshotBuilder, SnapshotStats};
use super::state::{ActorId, PhysicalState};

/// Spawn ring around the origin, metres
const SPAWN_RADIUS_MIN: f32 = 10.0;
const SPAWN_RADIUS_MAX: f32 = 40.0;

/// Commands accepted by a running world, drained at tick boundaries
#[derive(Debug)]
pub enum WorldCommand {
    Spawn {
        owner: Uuid,
        reply: oneshot::Sender<Result<SpawnInfo, WorldError>>,
    },
    Input {
        owner: Uuid,
        message: InputMessage,
    },
    Despawn {
        actor_id: ActorId,
    },
    /// Connection gone: despawn everything it owns
    Disconnect {
        owner: Uuid,
    },
}

/// Returned to the owner of a freshly spawned actor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnInfo {
    pub world_id: Uuid,
    pub actor_id: ActorId,
    pub snapshot: SnapshotMessage,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("World is full ({0} actors)")]
    Full(usize),

    #[error("World is not running")]
    Closed,

    #[error("World command queue is full")]
    Busy,
}

/// Counters shared with the HTTP layer
#[derive(Debug, Default)]
pub struct WorldStats {
    tick: AtomicU64,
    actors: AtomicUsize,
    snapshots_sent: AtomicU64,
    inputs_scheduled: AtomicU64,
    inputs_rewound: AtomicU64,
    inputs_dropped: AtomicU64,
}

/// Point-in-time copy of [`WorldStats`]
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct WorldStatsSummary {
    pub world_id: Uuid,
    pub tick: Tick,
    pub actors: usize,
    pub snapshots_sent: u64,
    pub inputs_scheduled: u64,
    pub inputs_rewound: u64,
    pub inputs_dropped: u64,
}

impl WorldStats {
    pub fn actors(&self) -> usize {
        self.actors.load(Ordering::Relaxed)
    }

    pub fn tick(&self) -> Tick {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn summary(&self, world_id: Uuid) -> WorldStatsSummary {
        WorldStatsSummary {
            world_id,
            tick: self.tick(),
            actors: self.actors(),
            snapshots_sent: self.snapshots_sent.load(Ordering::Relaxed),
            inputs_scheduled: self.inputs_scheduled.load(Ordering::Relaxed),
            inputs_rewound: self.inputs_rewound.load(Ordering::Relaxed),
            inputs_dropped: self.inputs_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running world
#[derive(Clone)]
pub struct WorldHandle {
    pub id: Uuid,
    pub tick_rate: u32,
    pub snapshot_interval: u32,
    command_tx: mpsc::Sender<WorldCommand>,
    snapshot_tx: broadcast::Sender<ServerMsg>,
    stats: Arc<WorldStats>,
}

impl WorldHandle {
    /// Receive every snapshot and notification the world broadcasts
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMsg> {
        self.snapshot_tx.subscribe()
    }

    pub fn stats(&self) -> WorldStatsSummary {
        self.stats.summary(self.id)
    }

    pub fn actor_count(&self) -> usize {
        self.stats.actors()
    }

    /// Ask the world loop for a new actor owned by `owner`
    pub async fn spawn(&self, owner: Uuid) -> Result<SpawnInfo, WorldError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(WorldCommand::Spawn { owner, reply })
            .await
            .map_err(|_| WorldError::Closed)?;
        response.await.map_err(|_| WorldError::Closed)?
    }

    /// Queue an input without waiting; a full queue drops it
    pub fn send_input(&self, owner: Uuid, message: InputMessage) -> Result<(), WorldError> {
        self.command_tx
            .try_send(WorldCommand::Input { owner, message })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => WorldError::Busy,
                mpsc::error::TrySendError::Closed(_) => WorldError::Closed,
            })
    }

    pub async fn despawn(&self, actor_id: ActorId) -> Result<(), WorldError> {
        self.command_tx
            .send(WorldCommand::Despawn { actor_id })
            .await
            .map_err(|_| WorldError::Closed)
    }

    pub async fn disconnect(&self, owner: Uuid) -> Result<(), WorldError> {
        self.command_tx
            .send(WorldCommand::Disconnect { owner })
            .await
            .map_err(|_| WorldError::Closed)
    }
}

/// Registry of all running worlds
pub struct WorldRegistry {
    worlds: DashMap<Uuid, WorldHandle>,
}

impl WorldRegistry {
    pub fn new() -> Self {
        Self {
            worlds: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<WorldHandle> {
        self.worlds.get(id).map(|w| w.value().clone())
    }

    pub fn insert(&self, handle: WorldHandle) {
        self.worlds.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<WorldHandle> {
        self.worlds.remove(id).map(|(_, h)| h)
    }

    pub fn active_worlds(&self) -> usize {
        self.worlds.len()
    }

    pub fn total_actors(&self) -> usize {
        self.worlds.iter().map(|w| w.value().actor_count()).sum()
    }

    pub fn stats(&self) -> Vec<WorldStatsSummary> {
        self.worlds.iter().map(|w| w.value().stats()).collect()
    }
}

impl Default for WorldRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative world. Owned by exactly one task.
pub struct World {
    id: Uuid,
    config: SimConfig,
    model: DriveModel,
    tick: Tick,
    actors: BTreeMap<ActorId, AuthoritativeActor>,
    command_rx: mpsc::Receiver<WorldCommand>,
    snapshot_tx: broadcast::Sender<ServerMsg>,
    snapshot_builder: SnapshotBuilder,
    snapshot_stats: SnapshotStats,
    rng: ChaCha8Rng,
    stats: Arc<WorldStats>,
    closed: bool,
}

impl World {
    /// Create a world with the production drive model
    pub fn new(id: Uuid, config: SimConfig) -> (Self, WorldHandle) {
        Self::with_model(id, config, DriveModel::default())
    }

    pub fn with_model(id: Uuid, config: SimConfig, model: DriveModel) -> (Self, WorldHandle) {
        let (command_tx, command_rx) = mpsc::channel(1024);
        let (snapshot_tx, _) = broadcast::channel(256);
        let stats = Arc::new(WorldStats::default());

        let handle = WorldHandle {
            id,
            tick_rate: config.tick_rate,
            snapshot_interval: config.snapshot_interval,
            command_tx,
            snapshot_tx: snapshot_tx.clone(),
            stats: stats.clone(),
        };

        let world = Self {
            id,
            model,
            tick: 0,
            actors: BTreeMap::new(),
            command_rx,
            snapshot_tx,
            snapshot_builder: SnapshotBuilder::new(config.snapshot_interval),
            snapshot_stats: SnapshotStats::default(),
            rng: ChaCha8Rng::seed_from_u64(config.world_seed),
            stats,
            closed: false,
            config,
        };

        (world, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Last simulated tick
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn actor(&self, actor_id: &ActorId) -> Option<&AuthoritativeActor> {
        self.actors.get(actor_id)
    }

    /// Actors in id order
    pub fn actors(&self) -> impl Iterator<Item = &AuthoritativeActor> + '_ {
        self.actors.values()
    }

    pub fn model(&self) -> &DriveModel {
        &self.model
    }

    pub fn snapshot_stats(&self) -> SnapshotStats {
        self.snapshot_stats
    }

    /// Run the authoritative tick loop until every handle is dropped
    pub async fn run(mut self) {
        info!(
            world_id = %self.id,
            tick_rate = self.config.tick_rate,
            snapshot_interval = self.config.snapshot_interval,
            "World started"
        );

        let mut clock = TickClock::new(self.tick, self.config.tick_rate, Instant::now().into_std());
        let mut tick_interval = interval(clock.step_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.closed {
            tick_interval.tick().await;

            // Catch up on every tick that became due; none are skipped
            for _ in clock.advance(Instant::now().into_std()) {
                self.step();
            }
        }

        info!(world_id = %self.id, tick = self.tick, "World stopped");
    }

    /// Drain pending commands, simulate one tick for every actor and
    /// broadcast a snapshot when one is due. Returns the new tick.
    pub fn step(&mut self) -> Tick {
        self.process_commands();

        self.tick += 1;
        let dt = self.config.dt();
        for actor in self.actors.values_mut() {
            actor.advance(&self.model, dt);
        }
        self.stats.tick.store(self.tick, Ordering::Relaxed);

        if self.snapshot_builder.should_send() && !self.actors.is_empty() {
            let snapshot = self.snapshot_builder.build(self.tick, self.actors.values());
            self.snapshot_stats.record(self.actors.len());
            self.stats.snapshots_sent.fetch_add(1, Ordering::Relaxed);

            // No subscribers is fine
            let _ = self.snapshot_tx.send(snapshot);
        }

        self.tick
    }

    /// Create an actor immediately, bypassing the command queue
    pub fn spawn_actor(&mut self, owner: Uuid) -> Result<SpawnInfo, WorldError> {
        if self.actors.len() >= self.config.max_actors {
            warn!(world_id = %self.id, owner = %owner, "World full, rejecting spawn");
            return Err(WorldError::Full(self.config.max_actors));
        }

        let (position, yaw) = self.spawn_pose();
        let actor_id = Uuid::new_v4();
        let actor = AuthoritativeActor::new(
            actor_id,
            owner,
            PhysicalState::at_rest(self.tick, position, yaw),
            self.config.history_capacity,
        );
        let snapshot = SnapshotMessage::from_snapshot(&actor.snapshot());

        self.actors.insert(actor_id, actor);
        self.stats.actors.store(self.actors.len(), Ordering::Relaxed);
        self.snapshot_builder.force_next();

        info!(
            world_id = %self.id,
            actor_id = %actor_id,
            owner = %owner,
            tick = self.tick,
            actor_count = self.actors.len(),
            "Actor spawned"
        );

        Ok(SpawnInfo {
            world_id: self.id,
            actor_id,
            snapshot,
        })
    }

    /// Remove an actor and its history
    pub fn despawn_actor(&mut self, actor_id: ActorId) -> bool {
        if self.actors.remove(&actor_id).is_none() {
            return false;
        }
        self.stats.actors.store(self.actors.len(), Ordering::Relaxed);
        let _ = self.snapshot_tx.send(ServerMsg::ActorDespawned { actor_id });
        info!(world_id = %self.id, actor_id = %actor_id, "Actor despawned");
        true
    }

    /// Apply one owner input to its actor
    pub fn apply_input(&mut self, owner: Uuid, message: InputMessage) -> Option<InputDisposition> {
        let Some(actor) = self.actors.get_mut(&message.actor_id) else {
            debug!(world_id = %self.id, actor_id = %message.actor_id, "Input for unknown actor");
            self.stats.inputs_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if actor.owner() != owner {
            warn!(
                world_id = %self.id,
                actor_id = %message.actor_id,
                sender = %owner,
                "Ignoring input from non-owner"
            );
            self.stats.inputs_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let disposition = actor.receive_input(&self.model, message.to_frame(), self.config.dt());
        match disposition {
            InputDisposition::Scheduled => {
                self.stats.inputs_scheduled.fetch_add(1, Ordering::Relaxed);
            }
            InputDisposition::Rewound { .. } => {
                self.stats.inputs_rewound.fetch_add(1, Ordering::Relaxed);
            }
            InputDisposition::Duplicate => {}
            InputDisposition::Stale | InputDisposition::TooEarly => {
                debug!(
                    world_id = %self.id,
                    actor_id = %message.actor_id,
                    tick = message.tick,
                    server_tick = self.tick,
                    ?disposition,
                    "Dropping input"
                );
                self.stats.inputs_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Some(disposition)
    }

    /// Drain the command queue without blocking
    fn process_commands(&mut self) {
        loop {
            match self.command_rx.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: WorldCommand) {
        match command {
            WorldCommand::Spawn { owner, reply } => {
                let result = self.spawn_actor(owner);
                if reply.send(result).is_err() {
                    debug!(world_id = %self.id, owner = %owner, "Spawn requester went away");
                }
            }
            WorldCommand::Input { owner, message } => {
                self.apply_input(owner, message);
            }
            WorldCommand::Despawn { actor_id } => {
                self.despawn_actor(actor_id);
            }
            WorldCommand::Disconnect { owner } => {
                let owned: Vec<ActorId> = self
                    .actors
                    .values()
                    .filter(|actor| actor.owner() == owner)
                    .map(AuthoritativeActor::id)
                    .collect();
                for actor_id in owned {
                    self.despawn_actor(actor_id);
                }
            }
        }
    }

    /// Random point on the spawn ring, facing a random direction
    fn spawn_pose(&mut self) -> (Vec3, f32) {
        let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
        let distance = self.rng.gen_range(SPAWN_RADIUS_MIN..SPAWN_RADIUS_MAX);
        let yaw = self.rng.gen_range(0.0..std::f32::consts::TAU);
        (
            Vec3::new(angle.cos() * distance, 0.0, angle.sin() * distance),
            yaw,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{ActionFlags, InputFrame};

    fn world(max_actors: usize) -> (World, WorldHandle) {
        World::new(
            Uuid::new_v4(),
            SimConfig {
                snapshot_interval: 2,
                max_actors,
                ..SimConfig::default()
            },
        )
    }

    fn throttle_input(actor_id: ActorId, tick: Tick) -> InputMessage {
        InputMessage::from_frame(actor_id, &InputFrame::new(tick, 1.0, 0.0, ActionFlags::NONE))
    }

    #[test]
    fn spawn_respects_capacity() {
        let (mut world, _handle) = world(1);
        assert!(world.spawn_actor(Uuid::new_v4()).is_ok());
        assert_eq!(world.spawn_actor(Uuid::new_v4()), Err(WorldError::Full(1)));
    }

    #[test]
    fn spawn_positions_follow_the_seed() {
        let (mut a, _ha) = world(4);
        let (mut b, _hb) = world(4);
        let first = a.spawn_actor(Uuid::new_v4()).map(|info| info.snapshot.position);
        let second = b.spawn_actor(Uuid::new_v4()).map(|info| info.snapshot.position);
        assert_eq!(first, second);
    }

    #[test]
    fn snapshots_are_broadcast_on_interval() {
        let (mut world, handle) = world(4);
        let mut updates = handle.subscribe();
        world.spawn_actor(Uuid::new_v4()).unwrap();

        // spawn forces the next snapshot
        world.step();
        assert!(matches!(updates.try_recv(), Ok(ServerMsg::Snapshot { tick: 1, .. })));
        world.step();
        assert!(updates.try_recv().is_err());
        world.step();
        assert!(matches!(updates.try_recv(), Ok(ServerMsg::Snapshot { tick: 3, .. })));
        assert_eq!(handle.stats().snapshots_sent, 2);
    }

    #[test]
    fn inputs_from_other_connections_are_ignored() {
        let (mut world, handle) = world(4);
        let owner = Uuid::new_v4();
        let info = world.spawn_actor(owner).unwrap();

        assert_eq!(world.apply_input(Uuid::new_v4(), throttle_input(info.actor_id, 1)), None);
        assert_eq!(
            world.apply_input(owner, throttle_input(info.actor_id, 1)),
            Some(InputDisposition::Scheduled)
        );
        assert_eq!(handle.stats().inputs_dropped, 1);
    }

    #[test]
    fn queued_commands_are_applied_at_the_tick_boundary() {
        let (mut world, handle) = world(4);
        let owner = Uuid::new_v4();
        let info = world.spawn_actor(owner).unwrap();

        handle.send_input(owner, throttle_input(info.actor_id, 1)).unwrap();
        world.step();

        let actor = world.actor(&info.actor_id).unwrap();
        assert!(actor.state().forward_speed() > 0.0);
        assert_eq!(handle.stats().inputs_scheduled, 1);
    }

    #[tokio::test]
    async fn disconnect_despawns_owned_actors() {
        let (mut world, handle) = world(4);
        let owner = Uuid::new_v4();
        let mut updates = handle.subscribe();
        let info = world.spawn_actor(owner).unwrap();
        world.spawn_actor(Uuid::new_v4()).unwrap();

        handle.disconnect(owner).await.unwrap();
        world.step();

        assert!(world.actor(&info.actor_id).is_none());
        assert_eq!(world.actors().count(), 1);
        assert!(matches!(
            updates.try_recv(),
            Ok(ServerMsg::ActorDespawned { actor_id }) if actor_id == info.actor_id
        ));
    }

    #[tokio::test]
    async fn run_loop_stops_when_handles_drop() {
        let (world, handle) = world(4);
        let task = tokio::spawn(world.run());

        let info = handle.spawn(Uuid::new_v4()).await.unwrap();
        assert_eq!(handle.actor_count(), 1);
        assert_eq!(info.world_id, handle.id);

        drop(handle);
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("world loop did not stop")
            .unwrap();
    }
}
