//! Session: the dependencies of all stage operations
//!
//! Holds the settings, the engine, the stage store and the port pool. The
//! pool is loaded from container labels on first use and guarded by a single
//! mutex, so allocations from concurrent callers are serialized.

use crate::accounting::Accounting;
use crate::config::Settings;
use crate::engine::{scan_allocations, Engine, LocalEngine};
use crate::error::{Result, StoolError};
use crate::pool::{Pool, PortProbe, PortRange, TcpProbe};
use crate::stage::config::StageConfig;
use crate::stage::lifecycle::Stage;
use crate::stage::store::StageStore;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct Session {
    settings: Arc<Settings>,
    engine: Arc<dyn Engine>,
    store: StageStore,
    probe: Arc<dyn PortProbe>,
    pool: Mutex<Option<Pool>>,
}

impl Session {
    pub fn new(settings: Arc<Settings>, engine: Arc<dyn Engine>) -> Self {
        let store = StageStore::new(settings.stages.clone());
        Self {
            settings,
            engine,
            store,
            probe: Arc::new(TcpProbe),
            pool: Mutex::new(None),
        }
    }

    /// Session on the local engine persisted in the settings' state file
    pub fn open(settings: Arc<Settings>) -> Result<Self> {
        let engine = LocalEngine::open(&settings.engine_state)?;
        Ok(Self::new(settings, Arc::new(engine)))
    }

    /// Replace the port probe used by the pool
    pub fn with_port_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn store(&self) -> &StageStore {
        &self.store
    }

    pub fn accounting(&self) -> Accounting<'_> {
        Accounting::new(self.engine.as_ref(), &self.settings, &self.store)
    }

    pub fn port_range(&self) -> Result<PortRange> {
        PortRange::new(self.settings.port_first, self.settings.port_last)
    }

    /// Run `f` with exclusive access to the pool, loading it first if needed
    pub fn with_pool<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Pool) -> Result<R>,
    {
        let mut guard = self
            .pool
            .lock()
            .map_err(|_| StoolError::Lock("Failed to acquire pool lock".to_string()))?;
        if guard.is_none() {
            let allocations = scan_allocations(self.engine.as_ref(), &self.settings.id)?;
            debug!("Loading pool with {} allocation(s)", allocations.len());
            *guard = Some(Pool::load(self.port_range()?, self.probe.clone(), allocations));
        }
        match guard.as_mut() {
            Some(pool) => f(pool),
            None => Err(StoolError::Lock("pool not loaded".to_string())),
        }
    }

    /// Re-read all allocations from the engine
    pub fn reload_pool(&self) -> Result<()> {
        let allocations = scan_allocations(self.engine.as_ref(), &self.settings.id)?;
        self.with_pool(|pool| {
            pool.rebuild(allocations);
            Ok(())
        })
    }

    pub fn create_stage(&self, name: &str, who: &str) -> Result<Stage<'_>> {
        let config = StageConfig::new(&self.settings, who);
        self.store.create(name, &config)?;
        Ok(Stage::new(self, name, config))
    }

    pub fn load_stage(&self, name: &str) -> Result<Stage<'_>> {
        let config = self.store.load(name)?;
        Ok(Stage::new(self, name, config))
    }

    pub fn list_stages(&self) -> Result<Vec<String>> {
        self.store.list()
    }
}
