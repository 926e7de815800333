//! Waiting for apps to come up
//!
//! A blocking poll loop: first until the management interface of an app
//! answers, then until it reports the `STARTED` state.

use crate::error::{Result, StoolError};
use crate::pool::Ports;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// State an app reports once it is fully started
pub const STARTED: &str = "STARTED";

/// Queries the state of a running app
pub trait ManagementProbe {
    /// Current state; an error means the interface is not reachable (yet)
    fn state(&self, app: &str, ports: &Ports) -> Result<String>;
}

/// Polling limits
#[derive(Debug, Clone, Copy)]
pub struct StartupPolicy {
    pub interval: Duration,
    /// Polls allowed until the management interface answers
    pub reach_attempts: u32,
    /// Polls allowed until the app is started
    pub started_attempts: u32,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            reach_attempts: 600,
            started_attempts: 3000,
        }
    }
}

/// Block until every app in `apps` reports [`STARTED`]
pub fn await_startup(
    stage: &str,
    apps: &BTreeMap<String, Ports>,
    probe: &dyn ManagementProbe,
    policy: &StartupPolicy,
) -> Result<()> {
    for (app, ports) in apps {
        let mut count = 0;
        let mut state = loop {
            match probe.state(app, ports) {
                Ok(state) => break state,
                Err(e) => {
                    if count > policy.reach_attempts {
                        return Err(StoolError::Timeout(format!(
                            "{}: {}: initial state timed out: {}",
                            stage, app, e
                        )));
                    }
                    if count % 100 == 99 {
                        info!("{}: {}: waiting for management interface ...", stage, app);
                    }
                }
            }
            count += 1;
            thread::sleep(policy.interval);
        };
        debug!("{}: {}: management interface reachable", stage, app);

        let mut count = 0;
        while state != STARTED {
            if count > policy.started_attempts {
                return Err(StoolError::Timeout(format!(
                    "{}: {}: {} timed out, state {}",
                    stage, app, STARTED, state
                )));
            }
            if count % 100 == 99 {
                info!("{}: {}: waiting for tomcat startup ... ({})", stage, app, state);
            }
            count += 1;
            thread::sleep(policy.interval);
            state = probe.state(app, ports).unwrap_or_else(|e| e.to_string());
        }
        info!("{}: {}: started", stage, app);
    }
    Ok(())
}

#[derive(Deserialize)]
struct JolokiaResponse {
    value: String,
}

/// Reads the server state through a Jolokia agent on the app's jmxmp port
pub struct JolokiaProbe {
    host: String,
    client: reqwest::blocking::Client,
}

impl JolokiaProbe {
    pub fn new(host: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| StoolError::Infrastructure(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            host: host.to_string(),
            client,
        })
    }
}

impl ManagementProbe for JolokiaProbe {
    fn state(&self, app: &str, ports: &Ports) -> Result<String> {
        let port = ports
            .jmxmp
            .ok_or_else(|| StoolError::Engine(format!("{}: no management port", app)))?;
        let url = format!(
            "http://{}:{}/jolokia/read/Catalina:type=Server/stateName",
            self.host, port
        );
        let response = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| StoolError::Engine(format!("{}: {}", url, e)))?;
        let body: JolokiaResponse = response
            .json()
            .map_err(|e| StoolError::Engine(format!("{}: invalid response: {}", url, e)))?;
        Ok(body.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays a fixed script of answers, repeating the last one
    struct Scripted(Mutex<Vec<Option<&'static str>>>);

    impl Scripted {
        fn new(mut script: Vec<Option<&'static str>>) -> Self {
            script.reverse();
            Self(Mutex::new(script))
        }
    }

    impl ManagementProbe for Scripted {
        fn state(&self, _app: &str, _ports: &Ports) -> Result<String> {
            let mut script = self.0.lock().unwrap();
            let next = if script.len() > 1 { script.pop().unwrap() } else { script[0] };
            next.map(str::to_string)
                .ok_or_else(|| StoolError::Engine("connection refused".to_string()))
        }
    }

    fn policy(reach: u32, started: u32) -> StartupPolicy {
        StartupPolicy {
            interval: Duration::from_millis(1),
            reach_attempts: reach,
            started_attempts: started,
        }
    }

    fn apps() -> BTreeMap<String, Ports> {
        BTreeMap::from([("web".to_string(), Ports::new(Some(9000), None, Some(9002), None))])
    }

    #[test]
    fn test_waits_until_started() {
        let probe = Scripted::new(vec![None, None, Some("STARTING"), Some("STARTED")]);
        await_startup("s1", &apps(), &probe, &policy(10, 10)).unwrap();
    }

    #[test]
    fn test_unreachable_times_out() {
        let probe = Scripted::new(vec![None]);
        let err = await_startup("s1", &apps(), &probe, &policy(3, 10)).unwrap_err();
        assert!(err.to_string().contains("s1: web: initial state timed out"));
    }

    #[test]
    fn test_stuck_state_times_out() {
        let probe = Scripted::new(vec![Some("STARTING")]);
        let err = await_startup("s1", &apps(), &probe, &policy(3, 5)).unwrap_err();
        assert!(err.to_string().contains("state STARTING"));
    }

    #[test]
    fn test_missing_management_port() {
        let probe = JolokiaProbe::new("localhost").unwrap();
        assert!(probe.state("web", &Ports::default()).is_err());
    }
}
