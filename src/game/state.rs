//! Simulation data model shared by client and server

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::time::Tick;

/// Identifies an actor within a world
pub type ActorId = Uuid;

/// Discrete per-tick actions packed into a bitset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionFlags(u8);

impl ActionFlags {
    pub const NONE: Self = Self(0);
    pub const BOOST: Self = Self(1 << 0);
    pub const JUMP: Self = Self(1 << 1);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn with(mut self, other: Self) -> Self {
        self.insert(other);
        self
    }
}

/// Control intent for one tick, produced only by the actor's owner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputFrame {
    pub tick: Tick,
    pub throttle: f32,
    pub turn: f32,
    pub actions: ActionFlags,
}

impl InputFrame {
    /// Build a frame, clamping axes into `[-1, 1]` and zeroing non-finite values
    pub fn new(tick: Tick, throttle: f32, turn: f32, actions: ActionFlags) -> Self {
        Self {
            tick,
            throttle: sanitize_axis(throttle),
            turn: sanitize_axis(turn),
            actions,
        }
    }

    /// No throttle, no turn, no actions
    pub fn neutral(tick: Tick) -> Self {
        Self {
            tick,
            throttle: 0.0,
            turn: 0.0,
            actions: ActionFlags::NONE,
        }
    }

    pub fn is_boosting(&self) -> bool {
        self.actions.contains(ActionFlags::BOOST)
    }

    pub fn is_jumping(&self) -> bool {
        self.actions.contains(ActionFlags::JUMP)
    }
}

fn sanitize_axis(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Boost progression, advanced one tick at a time by the simulator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BoostState {
    #[default]
    Idle,
    /// Boost held, charging for `ticks` so far
    Charging { ticks: u32 },
    /// Boost running with `remaining` ticks left
    Active { remaining: u32 },
}

impl BoostState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

/// Everything the simulation needs to continue from a tick.
///
/// Cosmetic values (visual scale, camera offsets, wheel spin) never live here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalState {
    pub tick: Tick,
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub boost: BoostState,
}

impl PhysicalState {
    /// A stationary actor at `position` facing `yaw` radians around +Y
    pub fn at_rest(tick: Tick, position: Vec3, yaw: f32) -> Self {
        Self {
            tick,
            position,
            rotation: Quat::from_rotation_y(yaw),
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            boost: BoostState::Idle,
        }
    }

    /// Unit vector the car is facing
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::Z
    }

    /// Signed speed along the facing direction
    pub fn forward_speed(&self) -> f32 {
        self.linear_velocity.dot(self.forward())
    }
}

/// One buffered tick: the input applied and the state it produced
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictedRecord {
    pub input: InputFrame,
    pub state: PhysicalState,
}

impl PredictedRecord {
    pub fn tick(&self) -> Tick {
        self.state.tick
    }
}

/// Server truth for one actor at `state.tick`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuthoritativeSnapshot {
    pub actor_id: ActorId,
    pub state: PhysicalState,
}

impl AuthoritativeSnapshot {
    pub fn tick(&self) -> Tick {
        self.state.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_axes_are_clamped() {
        let frame = InputFrame::new(3, 4.0, -2.5, ActionFlags::NONE);
        assert_eq!(frame.throttle, 1.0);
        assert_eq!(frame.turn, -1.0);

        let frame = InputFrame::new(3, f32::NAN, f32::INFINITY, ActionFlags::NONE);
        assert_eq!(frame.throttle, 0.0);
        assert_eq!(frame.turn, 0.0);
    }

    #[test]
    fn action_flags_compose() {
        let flags = ActionFlags::NONE.with(ActionFlags::BOOST);
        assert!(flags.contains(ActionFlags::BOOST));
        assert!(!flags.contains(ActionFlags::JUMP));
        assert_eq!(flags.with(ActionFlags::JUMP).bits(), 0b11);
    }

    #[test]
    fn forward_follows_yaw() {
        let state = PhysicalState::at_rest(0, Vec3::ZERO, std::f32::consts::FRAC_PI_2);
        let forward = state.forward();
        assert!((forward - Vec3::X).length() < 1e-5);
    }
}
