#![warn(missing_docs)]
//! Test surfaces for the control protocol: an in-memory transport pair, a
//! scripted protocol client, and a host whose ticks are stepped by the test.

mod client;
mod host;
mod memory;

pub use client::{CommandReply, Established, TestClient};
pub use host::{ManualHost, SimThread, TestWorld};
pub use memory::MemoryTransport;
