//! Car Sync - tick-synchronized input replication and state reconciliation
//! for networked cars.
//!
//! The server runs an authoritative [`game::World`] per session; each
//! controlling client runs a [`client::ClientSession`] that predicts its own
//! car and corrects against snapshots.

pub mod app;
pub mod client;
pub mod config;
pub mod game;
pub mod http;
pub mod net;
pub mod util;
pub mod ws;
