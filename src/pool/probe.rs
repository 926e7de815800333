//! Live port checks

use std::net::TcpListener;

/// Tells whether a port is free at the OS level
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Bind-then-close test on all interfaces. Does not hold the port.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

/// Treats every port as free; for pools whose ports never reach this host
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl PortProbe for NoProbe {
    fn is_free(&self, _port: u16) -> bool {
        true
    }
}
