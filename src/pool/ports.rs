//! Port sets

use crate::error::{Result, StoolError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Role of a port within a [`Ports`] set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortRole {
    Http,
    Https,
    /// Management (JMX over the jmxmp protocol, or an HTTP bridge to it)
    Jmxmp,
    Debug,
}

impl PortRole {
    pub const ALL: [PortRole; 4] = [
        PortRole::Http,
        PortRole::Https,
        PortRole::Jmxmp,
        PortRole::Debug,
    ];

    /// Label suffix
    pub fn name(&self) -> &'static str {
        match self {
            PortRole::Http => "http",
            PortRole::Https => "https",
            PortRole::Jmxmp => "jmxmp",
            PortRole::Debug => "debug",
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Role tagged ports of one app. `None` means unassigned.
///
/// Used both for the ports an image declares (container side) and for the
/// ports the pool allocated (host side).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ports {
    pub http: Option<u16>,
    pub https: Option<u16>,
    pub jmxmp: Option<u16>,
    pub debug: Option<u16>,
}

impl Ports {
    pub fn new(http: Option<u16>, https: Option<u16>, jmxmp: Option<u16>, debug: Option<u16>) -> Self {
        Self {
            http,
            https,
            jmxmp,
            debug,
        }
    }

    pub fn get(&self, role: PortRole) -> Option<u16> {
        match role {
            PortRole::Http => self.http,
            PortRole::Https => self.https,
            PortRole::Jmxmp => self.jmxmp,
            PortRole::Debug => self.debug,
        }
    }

    /// Assigned ports with their role
    pub fn assigned(&self) -> impl Iterator<Item = (PortRole, u16)> + '_ {
        PortRole::ALL
            .iter()
            .filter_map(move |role| self.get(*role).map(|port| (*role, port)))
    }

    pub fn contains(&self, port: u16) -> bool {
        self.assigned().any(|(_, p)| p == port)
    }

    pub fn is_empty(&self) -> bool {
        self.assigned().next().is_none()
    }

    /// Encode assigned ports as labels `<prefix><role>`
    pub fn to_labels(&self, prefix: &str) -> HashMap<String, String> {
        self.assigned()
            .map(|(role, port)| (format!("{}{}", prefix, role.name()), port.to_string()))
            .collect()
    }

    /// Decode ports from labels; missing labels are unassigned
    pub fn from_labels(labels: &HashMap<String, String>, prefix: &str) -> Result<Self> {
        let get = |role: PortRole| -> Result<Option<u16>> {
            let key = format!("{}{}", prefix, role.name());
            match labels.get(&key) {
                None => Ok(None),
                Some(value) => value.parse::<u16>().map(Some).map_err(|_| {
                    StoolError::InvalidProperty {
                        name: key.clone(),
                        message: format!("not a port: {}", value),
                    }
                }),
            }
        };
        Ok(Self {
            http: get(PortRole::Http)?,
            https: get(PortRole::Https)?,
            jmxmp: get(PortRole::Jmxmp)?,
            debug: get(PortRole::Debug)?,
        })
    }

    /// Map every declared (container) port of `self` to the host port of the same role
    pub fn map(&self, host: &Ports) -> Result<BTreeMap<u16, u16>> {
        let mut result = BTreeMap::new();
        for (role, container_port) in self.assigned() {
            let host_port = host.get(role).ok_or_else(|| {
                StoolError::Engine(format!("no host port allocated for {}", role))
            })?;
            result.insert(container_port, host_port);
        }
        Ok(result)
    }
}

impl fmt::Display for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .assigned()
            .map(|(role, port)| format!("{}={}", role, port))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        let ports = Ports::new(Some(9000), None, Some(9002), Some(9003));
        let labels = ports.to_labels("p.");
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["p.http"], "9000");
        assert!(!labels.contains_key("p.https"));
        assert_eq!(Ports::from_labels(&labels, "p.").unwrap(), ports);
    }

    #[test]
    fn test_from_labels_rejects_garbage() {
        let mut labels = HashMap::new();
        labels.insert("p.http".to_string(), "eighty".to_string());
        assert!(Ports::from_labels(&labels, "p.").is_err());
    }

    #[test]
    fn test_map_declared_to_host() {
        let declared = Ports::new(Some(8080), None, Some(5555), Some(5005));
        let host = Ports::new(Some(9000), Some(9001), Some(9002), Some(9003));
        let map = declared.map(&host).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map[&8080], 9000);
        assert_eq!(map[&5555], 9002);

        let partial = Ports::new(Some(9000), None, None, None);
        assert!(declared.map(&partial).is_err());
    }

    #[test]
    fn test_contains_and_display() {
        let ports = Ports::new(Some(1), Some(2), None, None);
        assert!(ports.contains(2));
        assert!(!ports.contains(3));
        assert_eq!(ports.to_string(), "http=1 https=2");
        assert!(Ports::default().is_empty());
    }
}
