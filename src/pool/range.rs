//! Port range

use crate::error::{Result, StoolError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed interval `[first, last]` of allocatable ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    first: u16,
    last: u16,
}

impl PortRange {
    /// Create a range; fails if `first > last` or `first == 0`
    pub fn new(first: u16, last: u16) -> Result<Self> {
        if first == 0 || first > last {
            return Err(StoolError::InvalidConfig(format!(
                "invalid port range {} .. {}",
                first, last
            )));
        }
        Ok(Self { first, last })
    }

    pub fn first(&self) -> u16 {
        self.first
    }

    pub fn last(&self) -> u16 {
        self.last
    }

    /// Number of ports in the range
    pub fn size(&self) -> u32 {
        u32::from(self.last) - u32::from(self.first) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.first && port <= self.last
    }

    /// The port after `port`, wrapping from `last` to `first`
    pub fn next(&self, port: u16) -> u16 {
        if port < self.last {
            port + 1
        } else {
            self.first
        }
    }

    /// Fail unless `port` is inside the range
    pub fn check(&self, port: u16) -> Result<()> {
        if self.contains(port) {
            Ok(())
        } else {
            Err(StoolError::PortOutOfRange {
                port,
                first: self.first,
                last: self.last,
            })
        }
    }

    pub fn exhausted(&self) -> StoolError {
        StoolError::NoFreePort {
            first: self.first,
            last: self.last,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.first, self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        let range = PortRange::new(9000, 9003).unwrap();
        assert_eq!(range.size(), 4);
        assert!(range.contains(9000));
        assert!(range.contains(9003));
        assert!(!range.contains(9004));
        assert_eq!(range.next(9002), 9003);
        assert_eq!(range.next(9003), 9000);
        assert!(range.check(8999).is_err());
    }

    #[test]
    fn test_single_port_range() {
        let range = PortRange::new(9000, 9000).unwrap();
        assert_eq!(range.size(), 1);
        assert_eq!(range.next(9000), 9000);
    }

    #[test]
    fn test_invalid() {
        assert!(PortRange::new(10, 9).is_err());
        assert!(PortRange::new(0, 9).is_err());
    }
}
