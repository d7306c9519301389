//! Sentinel control plane server.
//!
//! Composition root for the engine crates: loads [`config::Config`], builds
//! the store, dispatcher, and services, wires dispatcher jobs to them, and
//! serves the node-facing protocol. The external operator surface and web UI
//! consume the same service handles and the [`broadcast::Broadcaster`].

pub mod broadcast;
pub mod config;
pub mod handler;
pub mod server;

pub use broadcast::Broadcaster;
pub use config::Config;
pub use server::Server;
