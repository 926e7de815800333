//! Validation and repair sweep over all stages

use super::report::Report;
use crate::engine::scan_allocations;
use crate::error::Result;
use crate::pool::Ports;
use crate::session::Session;
use crate::stage::lifecycle::State;
use chrono::{Local, NaiveDate};
use regex::Regex;
use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, TcpListener, ToSocketAddrs};
use tracing::{error, info};

/// Name resolution, replaceable in tests
pub trait HostResolver {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;

    /// True if `address` belongs to this machine
    fn is_local(&self, address: IpAddr, port: u16) -> bool {
        TcpListener::bind((address, port)).is_ok()
    }
}

/// Resolver using the operating system
#[derive(Debug, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Ok((host, 0).to_socket_addrs()?.map(|a| a.ip()).collect())
    }
}

/// Checks constraints of all stages and optionally repairs violations
pub struct Validation<'a> {
    session: &'a Session,
    resolver: &'a dyn HostResolver,
}

impl<'a> Validation<'a> {
    pub fn new(session: &'a Session, resolver: &'a dyn HostResolver) -> Self {
        Self { session, resolver }
    }

    /// Validate all stages whose name matches `selector`
    pub fn run(&self, selector: Option<&Regex>, repair: bool) -> Result<Report> {
        self.run_at(selector, repair, Local::now().date_naive())
    }

    pub fn run_at(&self, selector: Option<&Regex>, repair: bool, today: NaiveDate) -> Result<Report> {
        let mut report = Report::new();
        self.server(&mut report);
        for name in self.session.list_stages()? {
            if selector.map_or(false, |s| !s.is_match(&name)) {
                continue;
            }
            if let Err(e) = self.stage(&name, repair, today, &mut report) {
                error!("{}: validation failed: {}", name, e);
                report.admin(format!("{}: validation failed: {}", name, e));
            }
        }
        info!("Validation done, {} recipient(s) to notify", report.recipients().count());
        Ok(report)
    }

    /// Infrastructure checks; admin only
    fn server(&self, report: &mut Report) {
        if let Err(e) = self.session.engine().ping() {
            report.admin(format!("cannot access docker: {}", e));
        }

        let hostname = &self.session.settings().hostname;
        match self.resolver.resolve(hostname) {
            Ok(addresses) if !addresses.is_empty() => {
                match self.session.with_pool(|pool| pool.temporary_port()) {
                    Ok(port) => {
                        if !addresses.iter().any(|a| self.resolver.is_local(*a, port)) {
                            report.admin(format!(
                                "hostname {} resolves to {:?}, which is not this machine",
                                hostname, addresses
                            ));
                        }
                    }
                    Err(e) => report.admin(format!("cannot check hostname {}: {}", hostname, e)),
                }
            }
            Ok(_) => report.admin(format!("cannot resolve hostname {}: no address", hostname)),
            Err(e) => report.admin(format!("cannot resolve hostname {}: {}", hostname, e)),
        }

        let wildcard = format!("foo.{}", hostname);
        if let Err(e) = self.resolver.resolve(&wildcard) {
            report.admin(format!("missing wildcard dns for {}: {}", hostname, e));
        }
    }

    fn stage(&self, name: &str, repair: bool, today: NaiveDate, report: &mut Report) -> Result<()> {
        let mut stage = self.session.load_stage(name)?;
        let mut problems: Vec<String> = stage
            .problems_at(today)?
            .iter()
            .map(ToString::to_string)
            .collect();
        if let Some(mismatch) = self.port_mismatch(name)? {
            problems.push(mismatch);
        }
        if problems.is_empty() {
            return Ok(());
        }
        let config = stage.config().clone();
        for problem in problems {
            report.user(&config, problem);
        }
        if !repair {
            return Ok(());
        }

        if stage.state()? == State::Up {
            match stage.stop(&[]) {
                Ok(_) => report.user(&config, format!("{}: stage has been stopped", name)),
                Err(e) => report.user(&config, format!("{}: stage failed to stop: {}", name, e)),
            }
        }

        let auto_remove = self.session.settings().auto_remove;
        match config.expire.expired_days_at(today) {
            Some(days) if auto_remove >= 0 && days >= 0 => {
                if days >= auto_remove {
                    report.user(&config, format!("{}: removing expired stage", name));
                    if let Err(e) = stage.remove() {
                        error!("{}: removal failed: {}", name, e);
                        report.user(&config, format!("{}: failed to remove expired stage: {}", name, e));
                    }
                } else {
                    report.user(
                        &config,
                        format!(
                            "{}: CAUTION: This stage will be removed automatically in {} day(s)",
                            name,
                            auto_remove - days
                        ),
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Compares the pool's records for `name` with the labels of its running containers
    fn port_mismatch(&self, name: &str) -> Result<Option<String>> {
        let internal = self.session.with_pool(|pool| Ok(pool.stage_allocations(name)))?;
        let external: BTreeMap<String, Ports> =
            scan_allocations(self.session.engine(), &self.session.settings().id)?
                .into_iter()
                .filter(|a| a.stage == name)
                .map(|a| (a.app, a.ports))
                .collect();
        if internal == external {
            return Ok(None);
        }
        Ok(Some(format!(
            "{}: ports mismatch: internal {}, external {}",
            name,
            describe(&internal),
            describe(&external)
        )))
    }
}

fn describe(ports: &BTreeMap<String, Ports>) -> String {
    if ports.is_empty() {
        return "none".to_string();
    }
    ports
        .iter()
        .map(|(app, ports)| format!("{}={}", app, ports))
        .collect::<Vec<_>>()
        .join(", ")
}
