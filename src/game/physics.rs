//! Car drive model and the deterministic step function

use glam::{Quat, Vec3};

use super::state::{BoostState, InputFrame, PhysicalState};

/// One tick of driving.
///
/// Implementations must be pure: the result may depend only on the arguments.
/// Live prediction, server simulation and replay all go through this trait.
pub trait Simulator {
    fn step(&self, state: &PhysicalState, input: &InputFrame, dt: f32) -> PhysicalState;
}

/// Drive tuning constants
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveTuning {
    /// Forward target speed at full throttle
    pub top_speed: f32,
    /// Target speed at full reverse throttle
    pub reverse_speed: f32,
    /// Exponential approach rate toward the target speed (1/s)
    pub approach_rate: f32,
    /// Maximum change of forward speed per second while driving
    pub max_acceleration: f32,
    /// Maximum change of forward speed per second while coasting
    pub rolling_deceleration: f32,
    /// Yaw rate at full turn and full authority (rad/s)
    pub turn_rate: f32,
    /// Turning authority at top speed
    pub min_turn_factor: f32,
    /// Height of the mid-speed authority bonus
    pub turn_peak_bonus: f32,
    /// Speed fraction below which authority ramps up from zero
    pub low_speed_band: f32,
    /// Boosted target speed
    pub boost_speed: f32,
    /// Boosted acceleration limit
    pub boost_acceleration: f32,
    /// Turning authority while boosting
    pub boost_turn_factor: f32,
    /// Ticks the boost button must be held before the boost fires
    pub boost_charge_ticks: u32,
    /// Ticks a fired boost lasts
    pub boost_active_ticks: u32,
    /// Upward velocity applied by a grounded jump
    pub jump_velocity: f32,
    pub gravity: f32,
}

impl Default for DriveTuning {
    fn default() -> Self {
        Self {
            top_speed: 50.0,
            reverse_speed: 20.0,
            approach_rate: 1.5,
            max_acceleration: 30.0,
            rolling_deceleration: 10.0,
            turn_rate: 160f32.to_radians(),
            min_turn_factor: 0.5,
            turn_peak_bonus: 1.5,
            low_speed_band: 0.1,
            boost_speed: 120.0,
            boost_acceleration: 40.0,
            boost_turn_factor: 0.15,
            boost_charge_ticks: 20,
            boost_active_ticks: 90,
            jump_velocity: 10.0,
            gravity: 30.0,
        }
    }
}

/// Boost progress as seen by cosmetic consumers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoostPhase {
    None,
    /// Charging, fraction of the charge completed
    Pending(f32),
    /// Running, fraction of the boost still remaining
    Active(f32),
}

/// Read-only drive capability offered to effects code
pub trait DriveStatus {
    fn boost_phase(&self) -> BoostPhase;
}

/// Production simulator: target-speed seeking with speed-dependent steering
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriveModel {
    pub tuning: DriveTuning,
}

impl DriveModel {
    pub fn new(tuning: DriveTuning) -> Self {
        Self { tuning }
    }

    /// Turning authority for a speed fraction in `[0, 1]`.
    ///
    /// Zero at standstill, peaks in the mid band, settles at
    /// `min_turn_factor` at top speed.
    pub fn turn_authority(&self, speed_fraction: f32) -> f32 {
        let t = &self.tuning;
        let s = speed_fraction.clamp(0.0, 1.0);
        let ramp = if t.low_speed_band > 0.0 {
            (s / t.low_speed_band).min(1.0)
        } else {
            1.0
        };
        let parabola = t.turn_peak_bonus * s * (1.0 - s);
        let blend = ((s - 0.15) / 0.7).clamp(0.0, 1.0);
        ramp * (t.min_turn_factor + parabola * blend)
    }

    /// Advance the boost state machine by one tick
    pub fn next_boost(&self, boost: BoostState, input: &InputFrame) -> BoostState {
        let t = &self.tuning;
        let held = input.is_boosting() && input.throttle > 0.0;
        match boost {
            BoostState::Idle if held => charge(1, t),
            BoostState::Idle => BoostState::Idle,
            BoostState::Charging { ticks } if held => charge(ticks + 1, t),
            BoostState::Charging { .. } => BoostState::Idle,
            BoostState::Active { remaining } if remaining > 1 => BoostState::Active {
                remaining: remaining - 1,
            },
            BoostState::Active { .. } => BoostState::Idle,
        }
    }

    pub fn boost_phase(&self, boost: BoostState) -> BoostPhase {
        let t = &self.tuning;
        match boost {
            BoostState::Idle => BoostPhase::None,
            BoostState::Charging { ticks } => {
                BoostPhase::Pending(fraction(ticks, t.boost_charge_ticks))
            }
            BoostState::Active { remaining } => {
                BoostPhase::Active(fraction(remaining, t.boost_active_ticks))
            }
        }
    }
}

fn charge(ticks: u32, tuning: &DriveTuning) -> BoostState {
    if ticks >= tuning.boost_charge_ticks {
        BoostState::Active {
            remaining: tuning.boost_active_ticks.max(1),
        }
    } else {
        BoostState::Charging { ticks }
    }
}

fn fraction(value: u32, total: u32) -> f32 {
    if total == 0 {
        1.0
    } else {
        (value as f32 / total as f32).clamp(0.0, 1.0)
    }
}

impl Simulator for DriveModel {
    fn step(&self, state: &PhysicalState, input: &InputFrame, dt: f32) -> PhysicalState {
        let t = &self.tuning;
        let boost = self.next_boost(state.boost, input);
        let boosting = boost.is_active();

        let turn_abs = input.turn.abs();
        let forward = state.forward();
        let current_speed = state.linear_velocity.dot(forward);

        // Forward speed: exponential approach toward the target, capped per tick
        let (target, accel_limit) = if boosting {
            (t.boost_speed, t.boost_acceleration)
        } else if input.throttle > 0.0 {
            (
                input.throttle * t.top_speed * lerp(1.0, 0.7, turn_abs),
                t.max_acceleration * lerp(1.0, 0.5, turn_abs),
            )
        } else if input.throttle < 0.0 {
            (
                input.throttle * t.reverse_speed * lerp(1.0, 0.7, turn_abs),
                t.max_acceleration * lerp(1.0, 0.5, turn_abs),
            )
        } else {
            (0.0, t.rolling_deceleration)
        };
        let approach = (target - current_speed) * (1.0 - (-t.approach_rate * dt).exp());
        let max_delta = accel_limit * dt;
        let speed = current_speed + approach.clamp(-max_delta, max_delta);

        // Yaw: speed-dependent authority, reversed when rolling backwards
        let reference_speed = if boosting { t.boost_speed } else { t.top_speed };
        let speed_fraction = if reference_speed > 0.0 {
            speed.abs() / reference_speed
        } else {
            0.0
        };
        let authority = if boosting {
            t.boost_turn_factor * (speed_fraction / t.low_speed_band.max(f32::EPSILON)).min(1.0)
        } else {
            self.turn_authority(speed_fraction)
        };
        let direction = if speed >= 0.0 { 1.0 } else { -1.0 };
        let yaw_rate = input.turn * t.turn_rate * authority * direction;
        let rotation = (Quat::from_rotation_y(yaw_rate * dt) * state.rotation).normalize();

        // Vertical: jump from the ground, gravity otherwise
        let grounded = state.position.y <= 0.0;
        let mut vertical = state.linear_velocity.y;
        if grounded && input.is_jumping() {
            vertical = t.jump_velocity;
        }
        vertical -= t.gravity * dt;

        // Grip: sideways velocity does not survive the tick
        let new_forward = rotation * Vec3::Z;
        let mut linear_velocity = new_forward * speed + Vec3::Y * vertical;
        let mut position = state.position + linear_velocity * dt;
        if position.y <= 0.0 {
            position.y = 0.0;
            linear_velocity.y = 0.0;
        }

        PhysicalState {
            tick: state.tick + 1,
            position,
            rotation,
            linear_velocity,
            angular_velocity: Vec3::new(0.0, yaw_rate, 0.0),
            boost,
        }
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t.clamp(0.0, 1.0)
}
