//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::state::{
    ActionFlags, ActorId, AuthoritativeSnapshot, BoostState, InputFrame, PhysicalState,
};
use crate::util::time::Tick;

/// Owner's control input for one tick (client -> server)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub actor_id: ActorId,
    pub tick: Tick,
    /// -1.0 = full reverse, 1.0 = full forward
    pub throttle: f32,
    /// -1.0 = full left, 1.0 = full right
    pub turn: f32,
    /// Bit 0 boost, bit 1 jump
    pub action_flags: u8,
}

impl InputMessage {
    pub fn from_frame(actor_id: ActorId, frame: &InputFrame) -> Self {
        Self {
            actor_id,
            tick: frame.tick,
            throttle: frame.throttle,
            turn: frame.turn,
            action_flags: frame.actions.bits(),
        }
    }

    /// Decode into a frame; axes are clamped on the way in
    pub fn to_frame(&self) -> InputFrame {
        InputFrame::new(
            self.tick,
            self.throttle,
            self.turn,
            ActionFlags::from_bits(self.action_flags),
        )
    }
}

/// Authoritative state of one actor at `tick` (server -> all peers)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub actor_id: ActorId,
    pub tick: Tick,
    pub position: [f32; 3],
    /// Quaternion as (x, y, z, w)
    pub rotation: [f32; 4],
    pub linear_velocity: [f32; 3],
    pub angular_velocity: [f32; 3],
    #[serde(default)]
    pub boost: BoostState,
}

impl SnapshotMessage {
    pub fn from_snapshot(snapshot: &AuthoritativeSnapshot) -> Self {
        let state = &snapshot.state;
        Self {
            actor_id: snapshot.actor_id,
            tick: state.tick,
            position: state.position.to_array(),
            rotation: state.rotation.to_array(),
            linear_velocity: state.linear_velocity.to_array(),
            angular_velocity: state.angular_velocity.to_array(),
            boost: state.boost,
        }
    }

    pub fn to_snapshot(&self) -> AuthoritativeSnapshot {
        AuthoritativeSnapshot {
            actor_id: self.actor_id,
            state: PhysicalState {
                tick: self.tick,
                position: Vec3::from_array(self.position),
                rotation: Quat::from_array(self.rotation),
                linear_velocity: Vec3::from_array(self.linear_velocity),
                angular_velocity: Vec3::from_array(self.angular_velocity),
                boost: self.boost,
            },
        }
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Request an actor; joins the default world when no id is given
    Join {
        #[serde(default)]
        world_id: Option<Uuid>,
    },

    /// Control input for one tick
    Input(InputMessage),

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Despawn the connection's actors
    Leave,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        connection_id: Uuid,
        server_time: u64,
        tick_rate: u32,
        snapshot_interval: u32,
    },

    /// Actor created for this connection, with its spawn state
    Spawned {
        world_id: Uuid,
        actor_id: ActorId,
        snapshot: SnapshotMessage,
    },

    /// Authoritative states for every actor at `tick`
    Snapshot {
        tick: Tick,
        actors: Vec<SnapshotMessage>,
    },

    /// Actor removed from the world
    ActorDespawned {
        actor_id: ActorId,
    },

    /// Error message
    Error {
        code: String,
        message: String,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
