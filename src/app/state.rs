//! Application state shared across routes

use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::game::world::{World, WorldHandle, WorldRegistry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<WorldRegistry>,
    /// World joined when a client does not name one
    pub default_world: WorldHandle,
}

impl AppState {
    /// Build the state and the default world. The caller spawns
    /// [`World::run`] on the returned world.
    pub fn new(config: Config) -> (Self, World) {
        let config = Arc::new(config);

        // Initialize world registry with the default world
        let registry = Arc::new(WorldRegistry::new());
        let (world, default_world) = World::new(Uuid::new_v4(), config.sim.clone());
        registry.insert(default_world.clone());

        let state = Self {
            config,
            registry,
            default_world,
        };

        (state, world)
    }
}
