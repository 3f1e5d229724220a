#![warn(missing_docs)]
//! Reference host for the control protocol: a fixed-rate `bevy_ecs`
//! simulation, the built-in world commands, and the QUIC control server.

pub mod commands;
pub mod config;
pub mod control;
pub mod host;
pub mod simulation;
pub mod world;

pub use commands::{builtin_registries, SetBlockFlags, SystemChat};
pub use config::ServerConfig;
pub use control::ControlServer;
pub use host::SimulationHost;
pub use simulation::Simulation;
