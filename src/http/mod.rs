//! HTTP surface: health, stats and the WebSocket upgrade

pub mod routes;

pub use routes::{build_router, AppError};
