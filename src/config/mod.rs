//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::game::reconcile::Tolerance;
use crate::game::smoothing::DEFAULT_CORRECTION_DURATION;
use crate::util::time::{DEFAULT_TICK_RATE, MAX_TICK_RATE};

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS, comma separated; empty allows any
    pub client_origin: String,
    /// Simulation and reconciliation settings
    pub sim: SimConfig,
}

/// Settings shared by the server world and client sessions.
///
/// Both peers must run with the same tick rate for replay to agree.
#[derive(Clone, Debug, PartialEq)]
pub struct SimConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Ticks between snapshot broadcasts
    pub snapshot_interval: u32,
    /// Records kept per actor history; must cover round trip plus jitter
    pub history_capacity: usize,
    /// Divergence accepted without correction
    pub tolerance: Tolerance,
    /// Consecutive corrections that count as persistent divergence
    pub divergence_streak: u32,
    /// Seconds over which a correction is eased out visually
    pub correction_smoothing_secs: f32,
    /// Actor limit per world
    pub max_actors: usize,
    /// Input messages accepted per connection per second
    pub input_rate_limit: u32,
    /// Seed for spawn placement
    pub world_seed: u64,
}

impl SimConfig {
    /// Fixed physics delta in seconds
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 || self.tick_rate > MAX_TICK_RATE {
            return Err(ConfigError::Invalid("TICK_RATE"));
        }
        if self.snapshot_interval == 0 {
            return Err(ConfigError::Invalid("SNAPSHOT_INTERVAL_TICKS"));
        }
        if self.history_capacity < 2 {
            return Err(ConfigError::Invalid("HISTORY_CAPACITY"));
        }
        let tolerance = &self.tolerance;
        if [
            tolerance.position,
            tolerance.rotation,
            tolerance.linear_velocity,
            tolerance.angular_velocity,
        ]
        .iter()
        .any(|value| !value.is_finite() || *value < 0.0)
        {
            return Err(ConfigError::Invalid("tolerance"));
        }
        Ok(())
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            snapshot_interval: 3,
            history_capacity: 128,
            tolerance: Tolerance::default(),
            divergence_streak: 10,
            correction_smoothing_secs: DEFAULT_CORRECTION_DURATION,
            max_actors: 32,
            input_rate_limit: DEFAULT_TICK_RATE * 2,
            world_seed: 0x5eed,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = SimConfig::default();
        let tick_rate = parse_or("TICK_RATE", defaults.tick_rate)?;
        let sim = SimConfig {
            tick_rate,
            snapshot_interval: parse_or("SNAPSHOT_INTERVAL_TICKS", defaults.snapshot_interval)?,
            history_capacity: parse_or("HISTORY_CAPACITY", defaults.history_capacity)?,
            tolerance: Tolerance {
                position: parse_or("POSITION_TOLERANCE", defaults.tolerance.position)?,
                rotation: parse_or("ROTATION_TOLERANCE", defaults.tolerance.rotation)?,
                linear_velocity: parse_or("VELOCITY_TOLERANCE", defaults.tolerance.linear_velocity)?,
                angular_velocity: parse_or(
                    "ANGULAR_VELOCITY_TOLERANCE",
                    defaults.tolerance.angular_velocity,
                )?,
            },
            divergence_streak: parse_or("DIVERGENCE_STREAK", defaults.divergence_streak)?,
            correction_smoothing_secs: parse_or(
                "CORRECTION_SMOOTHING_SECS",
                defaults.correction_smoothing_secs,
            )?,
            max_actors: parse_or("MAX_ACTORS_PER_WORLD", defaults.max_actors)?,
            input_rate_limit: parse_or("INPUT_RATE_LIMIT", tick_rate.saturating_mul(2))?,
            world_seed: parse_or("WORLD_SEED", defaults.world_seed)?,
        };
        sim.validate()?;

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_default(),
            sim,
        })
    }
}

/// Read `key`, falling back to `default` when unset
fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid(key))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let sim = SimConfig::default();
        assert!(sim.validate().is_ok());
        assert!((sim.dt() - 1.0 / 60.0).abs() < f32::EPSILON);
    }

    #[test]
    fn zero_tick_rate_is_rejected() {
        let sim = SimConfig {
            tick_rate: 0,
            ..SimConfig::default()
        };
        assert!(matches!(sim.validate(), Err(ConfigError::Invalid("TICK_RATE"))));
    }

    #[test]
    fn tick_rate_above_the_cap_is_rejected() {
        let at_cap = SimConfig {
            tick_rate: MAX_TICK_RATE,
            ..SimConfig::default()
        };
        assert!(at_cap.validate().is_ok());

        let sim = SimConfig {
            tick_rate: 2_000_000_000,
            ..SimConfig::default()
        };
        assert!(matches!(sim.validate(), Err(ConfigError::Invalid("TICK_RATE"))));
    }

    #[test]
    fn negative_tolerance_is_rejected() {
        let mut sim = SimConfig::default();
        sim.tolerance.position = -1.0;
        assert!(matches!(sim.validate(), Err(ConfigError::Invalid("tolerance"))));
    }

    #[test]
    fn values_are_trimmed_before_parsing() {
        assert_eq!(parse_value::<u32>("TICK_RATE", " 30 ").ok(), Some(30));
        assert!(matches!(
            parse_value::<f32>("POSITION_TOLERANCE", "wide"),
            Err(ConfigError::Invalid("POSITION_TOLERANCE"))
        ));
    }
}
