//! Port pool module
//!
//! This module hands out TCP ports to the apps of a stage. Allocations are
//! deterministic per `(app, stage)`, never overlap, and are reconstructed
//! from engine labels when the process starts.

pub mod allocator;
pub mod ports;
pub mod probe;
pub mod range;

pub use allocator::{Allocation, Pool};
pub use ports::{PortRole, Ports};
pub use probe::{NoProbe, PortProbe, TcpProbe};
pub use range::PortRange;
