//! Port allocation pool

use super::ports::Ports;
use super::probe::PortProbe;
use super::range::PortRange;
use crate::error::{Result, StoolError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Ports held by one `(stage, app)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub stage: String,
    pub app: String,
    pub ports: Ports,
}

impl Allocation {
    pub fn new(stage: &str, app: &str, ports: Ports) -> Self {
        Self {
            stage: stage.to_string(),
            app: app.to_string(),
            ports,
        }
    }

    fn is(&self, stage: &str, app: &str) -> bool {
        self.stage == stage && self.app == app
    }
}

/// Hands out collision free ports for `(stage, app)` pairs.
///
/// The allocation list is a cache of what the engine's container labels say;
/// it can be rebuilt from them at any time (see [`Pool::rebuild`]). It is not
/// synchronized itself: share it behind a single mutex.
pub struct Pool {
    range: PortRange,
    allocations: Vec<Allocation>,
    probe: Arc<dyn PortProbe>,
}

impl Pool {
    /// Create an empty pool
    pub fn new(range: PortRange, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            range,
            allocations: Vec::new(),
            probe,
        }
    }

    /// Create a pool seeded with allocations read from the engine
    pub fn load(range: PortRange, probe: Arc<dyn PortProbe>, allocations: Vec<Allocation>) -> Self {
        let mut pool = Self::new(range, probe);
        pool.rebuild(allocations);
        pool
    }

    /// Replace all records with the given ones
    pub fn rebuild(&mut self, allocations: Vec<Allocation>) {
        self.allocations.clear();
        for allocation in allocations {
            // first record wins if the engine reports the same pair twice
            if self.lookup(&allocation.stage, &allocation.app).is_none() {
                self.allocations.push(allocation);
            }
        }
        debug!("Pool rebuilt with {} allocation(s)", self.allocations.len());
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    /// Allocate ports for `app` of `stage`.
    ///
    /// Returns the existing ports unchanged if the pair already has an
    /// allocation and `http`/`https` (if given) match it. Otherwise a fresh
    /// set is probed, starting at a position derived from `app + stage`, and
    /// replaces the old record. If probing fails the old record stays.
    pub fn allocate(
        &mut self,
        stage: &str,
        app: &str,
        http: Option<u16>,
        https: Option<u16>,
    ) -> Result<Ports> {
        let previous = self.lookup(stage, app);
        if let Some(previous) = previous {
            let conflict = http.map_or(false, |port| previous.http != Some(port))
                || https.map_or(false, |port| previous.https != Some(port));
            if !conflict {
                return Ok(previous);
            }
            debug!("{}/{}: requested ports differ from {}, reallocating", stage, app, previous);
            self.release(stage, app);
        }
        let start = self.start_port(app, stage);
        let ports = match self.allocate_from(start, http, https) {
            Ok(ports) => ports,
            Err(e) => {
                if let Some(previous) = previous {
                    self.allocations.push(Allocation::new(stage, app, previous));
                }
                return Err(e);
            }
        };
        debug!("{}/{}: allocated {}", stage, app, ports);
        self.allocations.push(Allocation::new(stage, app, ports));
        Ok(ports)
    }

    fn allocate_from(&self, start: u16, http: Option<u16>, https: Option<u16>) -> Result<Ports> {
        let mut taken = Vec::with_capacity(4);

        let http = match http {
            Some(port) => self.fixed(port, &taken)?,
            None => self.one(start, &taken)?,
        };
        taken.push(http);

        let https = match https {
            Some(port) => self.fixed(port, &taken)?,
            None => self.one(start, &taken)?,
        };
        taken.push(https);

        let jmxmp = self.one(start, &taken)?;
        taken.push(jmxmp);

        let debug = self.one(start, &taken)?;

        Ok(Ports::new(Some(http), Some(https), Some(jmxmp), Some(debug)))
    }

    /// Validate an explicitly requested port
    fn fixed(&self, port: u16, taken: &[u16]) -> Result<u16> {
        self.range.check(port)?;
        if taken.contains(&port) {
            return Err(StoolError::PortAllocated {
                port,
                owner: "this request".to_string(),
            });
        }
        if let Some(owner) = self.owner(port) {
            return Err(StoolError::PortAllocated {
                port,
                owner: format!("{}/{}", owner.stage, owner.app),
            });
        }
        if !self.probe.is_free(port) {
            return Err(StoolError::PortInUse(port));
        }
        Ok(port)
    }

    /// First usable port at or after `start`, wrapping at the end of the range
    fn one(&self, start: u16, taken: &[u16]) -> Result<u16> {
        self.range.check(start)?;
        let mut current = start;
        loop {
            if !taken.contains(&current) && !self.is_allocated(current) {
                if self.probe.is_free(current) {
                    return Ok(current);
                }
                debug!("port {} is bound outside the pool, skipping", current);
            }
            current = self.range.next(current);
            if current == start {
                return Err(self.range.exhausted());
            }
        }
    }

    /// Deterministic, even aligned start position for `app + stage`
    pub fn start_port(&self, app: &str, stage: &str) -> u16 {
        let hash = string_hash(&format!("{}{}", app, stage));
        let hash = if hash < 0 { hash.checked_neg().unwrap_or(0) } else { hash };
        let offset = (hash as u32) % self.range.size();
        let aligned = ((u32::from(self.range.first()) + offset) & !1) as u16;
        aligned.max(self.range.first())
    }

    /// Drop the record of one app; true if there was one
    pub fn release(&mut self, stage: &str, app: &str) -> bool {
        let before = self.allocations.len();
        self.allocations.retain(|a| !a.is(stage, app));
        before != self.allocations.len()
    }

    /// Drop all records of a stage; returns the number removed
    pub fn release_stage(&mut self, stage: &str) -> usize {
        let before = self.allocations.len();
        self.allocations.retain(|a| a.stage != stage);
        before - self.allocations.len()
    }

    fn lookup(&self, stage: &str, app: &str) -> Option<Ports> {
        self.allocations
            .iter()
            .find(|a| a.is(stage, app))
            .map(|a| a.ports)
    }

    /// App to ports for one stage
    pub fn stage_allocations(&self, stage: &str) -> BTreeMap<String, Ports> {
        self.allocations
            .iter()
            .filter(|a| a.stage == stage)
            .map(|a| (a.app.clone(), a.ports))
            .collect()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.owner(port).is_some()
    }

    /// Record holding `port`, if any
    pub fn owner(&self, port: u16) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.ports.contains(port))
    }

    /// First even stepped port not recorded as allocated; no record is created
    pub fn temporary_port(&self) -> Result<u16> {
        (u32::from(self.range.first())..=u32::from(self.range.last()))
            .step_by(2)
            .map(|port| port as u16)
            .find(|port| !self.is_allocated(*port))
            .ok_or_else(|| self.range.exhausted())
    }
}

/// 31-based polynomial hash over UTF-16 code units with wrapping i32
/// arithmetic, stable across runs and platforms
fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}
