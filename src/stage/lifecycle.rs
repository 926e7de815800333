//! Stage lifecycle
//!
//! A [`Stage`] is built into one image per app, started into one container
//! per app, stopped and finally removed. Ports come from the session's pool;
//! images and containers are found through their labels.

use super::config::StageConfig;
use super::image::{Current, Image};
use super::startup::{self, ManagementProbe, StartupPolicy};
use super::store::StageStore;
use super::template;
use crate::engine::labels::{
    self, LABEL_APP, LABEL_COMMENT, LABEL_CONTAINER_PORT_PREFIX, LABEL_CREATED_BY,
    LABEL_CREATED_ON, LABEL_HOST_PORT_PREFIX, LABEL_MEMORY, LABEL_ORIGIN, LABEL_SECRETS_PREFIX,
};
use crate::engine::{BuildRequest, ContainerSpec, ContainerStatus, Mount};
use crate::error::{Result, StoolError};
use crate::outcome::Outcome;
use crate::pool::Ports;
use crate::session::Session;
use chrono::{Local, NaiveDate};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Grace period for containers to shut down
pub const STOP_TIMEOUT: Duration = Duration::from_secs(300);

const MB: u64 = 1024 * 1024;
const LOG_MOUNT: &str = "/var/log/stool";
const KEYSTORE_MOUNT: &str = "/etc/stool/keystore.p12";

/// Whether anything of a stage is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Up,
    Down,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Up => write!(f, "up"),
            State::Down => write!(f, "down"),
        }
    }
}

/// Parameters of a build
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub app: String,
    /// War or jar file to deploy
    pub artifact: PathBuf,
    /// Template name; chosen from the artifact type if not set
    pub template: Option<String>,
    /// Overrides for template variables
    pub args: BTreeMap<String, String>,
    /// Secret project to container path
    pub secrets: BTreeMap<String, String>,
    pub no_cache: bool,
    /// Images to keep for the app including the new one, 0 to keep all
    pub keep: usize,
    pub comment: String,
    pub origin: String,
    pub who: String,
    pub created_on: String,
}

/// Result of a build. A failing build is not an error: its output is still
/// worth showing.
#[derive(Debug)]
pub enum BuildOutcome {
    Built { image: Image, output: String },
    Failed { summary: String, output: String },
}

/// Explicit host ports for one app
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortRequest {
    pub http: Option<u16>,
    pub https: Option<u16>,
}

/// Parameters of a start
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// `(app, image index)`; empty selects the newest image of every app
    pub selection: Vec<(String, usize)>,
    pub ports: BTreeMap<String, PortRequest>,
    /// Environment on top of the settings' and stage's environment
    pub environment: BTreeMap<String, String>,
}

/// One stage with its configuration
pub struct Stage<'a> {
    session: &'a Session,
    name: String,
    config: StageConfig,
}

impl<'a> Stage<'a> {
    pub(crate) fn new(session: &'a Session, name: &str, config: StageConfig) -> Self {
        Self {
            session,
            name: name.to_string(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Change properties and save
    pub fn set_config(&mut self, assignments: &BTreeMap<String, String>, who: &str) -> Result<()> {
        self.config.set(assignments, who)?;
        self.session.store().save(&self.name, &self.config)
    }

    fn labels(&self) -> HashMap<String, String> {
        labels::stage_labels(&self.session.settings().id, &self.name)
    }

    fn app_labels(&self, app: &str) -> HashMap<String, String> {
        let mut result = self.labels();
        result.insert(LABEL_APP.to_string(), app.to_string());
        result
    }

    /// Violated constraints as of `today`: expiry and disk quota
    pub fn problems_at(&self, today: NaiveDate) -> Result<Vec<StoolError>> {
        let mut problems = Vec::new();
        if self.config.expire.is_expired_at(today) {
            problems.push(StoolError::Expired {
                stage: self.name.clone(),
                expire: self.config.expire.to_string(),
            });
        }
        if self.config.quota > 0 {
            let used = self.session.accounting().disk_used(&self.name)?;
            if used > self.config.quota {
                problems.push(StoolError::QuotaExceeded {
                    stage: self.name.clone(),
                    used,
                    quota: self.config.quota,
                });
            }
        }
        Ok(problems)
    }

    /// Fail with the first violated constraint
    pub fn check_constraints(&self) -> Result<()> {
        match self.problems_at(Local::now().date_naive())?.into_iter().next() {
            Some(problem) => Err(problem),
            None => Ok(()),
        }
    }

    /// Images by app, newest first
    pub fn images(&self) -> Result<BTreeMap<String, Vec<Image>>> {
        Image::list(self.session.engine(), &self.session.settings().id, &self.name)
    }

    /// Running containers by app
    fn running(&self) -> Result<BTreeMap<String, String>> {
        let engine = self.session.engine();
        let mut result = BTreeMap::new();
        for id in engine.list_containers(&self.labels(), true)? {
            let info = engine.inspect_container(&id)?;
            match info.labels.get(LABEL_APP) {
                Some(app) => {
                    result.insert(app.clone(), id);
                }
                None => warn!("{}: container {} has no app label", self.name, id),
            }
        }
        Ok(result)
    }

    /// The current image of every app and its running container, if any
    pub fn current_map(&self) -> Result<BTreeMap<String, Current>> {
        let running = self.running()?;
        let mut result = BTreeMap::new();
        for (app, images) in self.images()? {
            let Some(newest) = images.first() else {
                continue;
            };
            let container = running.get(&app).cloned();
            let image = match &container {
                Some(id) => {
                    let info = self.session.engine().inspect_container(id)?;
                    images.iter().find(|i| i.id == info.image_id).unwrap_or(newest).clone()
                }
                None => newest.clone(),
            };
            result.insert(app, Current { image, container });
        }
        Ok(result)
    }

    pub fn state(&self) -> Result<State> {
        Ok(if self.running()?.is_empty() {
            State::Down
        } else {
            State::Up
        })
    }

    /// Allocated host ports by app
    pub fn ports(&self) -> Result<BTreeMap<String, Ports>> {
        self.session.with_pool(|pool| Ok(pool.stage_allocations(&self.name)))
    }

    /// Urls of every app with allocated ports
    pub fn urls(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let hostname = &self.session.settings().hostname;
        let mut result = BTreeMap::new();
        for (app, ports) in self.ports()? {
            let host = format!("{}.{}.{}", app, self.name, hostname);
            let mut urls = Vec::new();
            if let Some(port) = ports.http {
                urls.push(format!("http://{}:{}/", host, port));
            }
            if let Some(port) = ports.https {
                urls.push(format!("https://{}:{}/", host, port));
            }
            result.insert(app, urls);
        }
        Ok(result)
    }

    /// Build a new image for `options.app`
    pub fn build(&mut self, options: &BuildOptions) -> Result<BuildOutcome> {
        self.check_constraints()?;
        self.session.accounting().check_disk(&self.name)?;
        StageStore::validate_name(&options.app)?;

        let template = match &options.template {
            Some(name) => template::lookup(name)?,
            None => template::for_artifact(&options.artifact),
        };
        let args = template.args(&options.args)?;
        let memory = template.memory(&args)?;

        if options.keep > 0 {
            self.wipe_old_images(&options.app, options.keep - 1)?;
        }

        let context = self.session.store().context_dir(&self.name).join(&options.app);
        template.write_context(&context, &options.artifact, &args)?;

        let tag = format!(
            "{}/{}/{}:{}",
            self.session.settings().id,
            self.name,
            options.app,
            Local::now().format("%y%m%d-%H%M%S")
        );
        let mut labels = self.app_labels(&options.app);
        labels.insert(LABEL_COMMENT.to_string(), options.comment.clone());
        labels.insert(LABEL_ORIGIN.to_string(), options.origin.clone());
        labels.insert(LABEL_CREATED_BY.to_string(), options.who.clone());
        labels.insert(LABEL_CREATED_ON.to_string(), options.created_on.clone());
        labels.insert(LABEL_MEMORY.to_string(), memory.to_string());
        labels.extend(template.ports.to_labels(LABEL_CONTAINER_PORT_PREFIX));
        for (project, path) in &options.secrets {
            labels.insert(format!("{}{}", LABEL_SECRETS_PREFIX, project), path.clone());
        }

        info!("{}: building {} with template {}", self.name, tag, template.name);
        let result = self.session.engine().build_image(&BuildRequest {
            tag,
            build_args: args,
            labels,
            context_dir: context,
            no_cache: options.no_cache,
        });

        let output = match &result {
            Ok(built) => built.output.as_str(),
            Err(StoolError::Build { output, .. }) => output.as_str(),
            Err(_) => "",
        };
        let logs = self.session.store().logs_dir(&self.name);
        fs::create_dir_all(&logs)?;
        fs::write(logs.join(format!("build-{}.log", options.app)), output)?;

        match result {
            Ok(built) => {
                self.config.last_modified_by = options.who.clone();
                self.session.store().save(&self.name, &self.config)?;
                let image = Image::from_meta(&self.session.engine().inspect_image(&built.id)?)?;
                Ok(BuildOutcome::Built {
                    image,
                    output: built.output,
                })
            }
            Err(StoolError::Build { summary, output }) => {
                warn!("{}: build of {} failed: {}", self.name, options.app, summary);
                Ok(BuildOutcome::Failed { summary, output })
            }
            Err(e) => Err(e),
        }
    }

    /// Remove all but the `keep` newest images of `app`; returns the number removed
    pub fn wipe_old_images(&self, app: &str, keep: usize) -> Result<usize> {
        let engine = self.session.engine();
        let images = self.images()?.remove(app).unwrap_or_default();
        let mut removed = 0;
        for image in images.iter().skip(keep) {
            for container in engine.list_containers_for_image(&image.id)? {
                if engine.container_status(&container)? != ContainerStatus::Running {
                    engine.remove_container(&container)?;
                }
            }
            debug!("{}: removing image {}", self.name, image.id);
            engine.remove_image(&image.id, true)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn select(
        &self,
        images: &BTreeMap<String, Vec<Image>>,
        selection: &[(String, usize)],
    ) -> Result<Vec<(String, Image)>> {
        if selection.is_empty() {
            return Ok(images
                .iter()
                .filter_map(|(app, list)| list.first().map(|image| (app.clone(), image.clone())))
                .collect());
        }
        let unknown: Vec<&str> = selection
            .iter()
            .filter(|(app, _)| !images.contains_key(app))
            .map(|(app, _)| app.as_str())
            .collect();
        if !unknown.is_empty() {
            return Err(StoolError::UnknownApp {
                stage: self.name.clone(),
                apps: unknown.join(", "),
            });
        }
        selection
            .iter()
            .map(|(app, index)| {
                images
                    .get(app)
                    .and_then(|list| list.get(*index))
                    .map(|image| (app.clone(), image.clone()))
                    .ok_or_else(|| StoolError::AppIndex {
                        stage: self.name.clone(),
                        app: app.clone(),
                        index: *index,
                    })
            })
            .collect()
    }

    /// Start the selected apps. Apps that already run are skipped with a warning.
    pub fn start(&mut self, request: &StartRequest) -> Result<Outcome> {
        self.check_constraints()?;
        let images = self.images()?;
        if images.is_empty() {
            return Err(StoolError::NothingBuilt {
                stage: self.name.clone(),
            });
        }
        let selected = self.select(&images, &request.selection)?;
        let running = self.running()?;

        let mut outcome = Outcome::new();
        let mut todo = Vec::new();
        for (app, image) in selected {
            if running.contains_key(&app) {
                outcome.warn(format!("{}: {}: app already running", self.name, app));
            } else {
                todo.push((app, image));
            }
        }

        if let Some(mut unreserved) = self.session.accounting().memory_unreserved()? {
            for (app, image) in &todo {
                if image.memory > unreserved {
                    return Err(StoolError::MemoryExhausted {
                        stage: self.name.clone(),
                        app: app.clone(),
                        requested: image.memory,
                        unreserved,
                    });
                }
                unreserved -= image.memory;
            }
        }

        for (app, image) in &todo {
            let ports = request.ports.get(app).copied().unwrap_or_default();
            self.start_app(app, image, ports, &request.environment, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn start_app(
        &self,
        app: &str,
        image: &Image,
        requested: PortRequest,
        environment: &BTreeMap<String, String>,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let engine = self.session.engine();
        let mut stale = engine.list_containers_for_image(&image.id)?;
        for id in engine.list_containers(&self.app_labels(app), false)? {
            if !stale.contains(&id) {
                stale.push(id);
            }
        }
        for id in stale {
            if engine.container_status(&id)? != ContainerStatus::Running {
                debug!("{}: {}: removing stale container {}", self.name, app, id);
                engine.remove_container(&id)?;
            }
        }

        let ports = self
            .session
            .with_pool(|pool| pool.allocate(&self.name, app, requested.http, requested.https))?;
        let result = self.create_container(app, image, &ports, environment, outcome);
        if result.is_err() {
            self.session.with_pool(|pool| Ok(pool.release(&self.name, app)))?;
        }
        result
    }

    fn create_container(
        &self,
        app: &str,
        image: &Image,
        ports: &Ports,
        environment: &BTreeMap<String, String>,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let settings = self.session.settings();
        let engine = self.session.engine();

        let logs = self.session.store().logs_dir(&self.name).join(app);
        fs::create_dir_all(&logs)?;
        let mut mounts = vec![Mount::new(logs, LOG_MOUNT)];
        // https is served only if the image declares it and a host port was allocated
        if image.ports.https.is_some() && ports.https.is_some() {
            let keystore = settings.certificates.join(format!("{}.{}.p12", app, self.name));
            if keystore.is_file() {
                mounts.push(Mount::new(keystore, KEYSTORE_MOUNT).read_only());
            } else {
                outcome.warn(format!(
                    "{}: {}: no keystore at {}, https will not work",
                    self.name,
                    app,
                    keystore.display()
                ));
            }
        }
        for (project, path) in &image.secrets {
            let dir = settings.secrets.join(project);
            if !dir.is_dir() {
                return Err(StoolError::InvalidConfig(format!(
                    "{}: {}: secrets not found: {}",
                    self.name,
                    app,
                    dir.display()
                )));
            }
            mounts.push(Mount::new(dir, path).read_only());
        }

        let mut env = settings.environment.clone();
        env.extend(self.config.environment.clone());
        env.extend(environment.clone());

        let mut labels = self.app_labels(app);
        labels.extend(ports.to_labels(LABEL_HOST_PORT_PREFIX));

        let spec = ContainerSpec {
            image_id: image.id.clone(),
            name: format!("{}.{}.{}", app, self.name, settings.hostname),
            memory_bytes: image.memory * MB,
            labels,
            env,
            mounts,
            ports: image.ports.map(ports)?,
        };
        let id = engine.create_container(&spec)?;
        if let Err(e) = self.run_container(app, &id) {
            // the container carries host port labels; it must not outlive the allocation
            warn!("{}: {}: start failed, removing container {}: {}", self.name, app, id, e);
            if let Err(cleanup) = engine
                .stop_container(&id, STOP_TIMEOUT)
                .and_then(|_| engine.remove_container(&id))
            {
                error!("{}: {}: cannot remove container {}: {}", self.name, app, id, cleanup);
            }
            return Err(e);
        }
        info!("{}: {} started as container {} ({})", self.name, app, id, ports);
        Ok(())
    }

    fn run_container(&self, app: &str, id: &str) -> Result<()> {
        let engine = self.session.engine();
        engine.start_container(id)?;
        let status = engine.container_status(id)?;
        if status != ContainerStatus::Running {
            return Err(StoolError::ContainerStatus {
                stage: self.name.clone(),
                app: app.to_string(),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    /// Stop the selected apps, or all running apps if `selection` is empty
    pub fn stop(&mut self, selection: &[String]) -> Result<Outcome> {
        let running = self.running()?;
        if running.is_empty() {
            return Err(StoolError::AlreadyStopped(self.name.clone()));
        }
        let mut outcome = Outcome::new();
        let apps: Vec<String> = if selection.is_empty() {
            running.keys().cloned().collect()
        } else {
            let images = self.images()?;
            let unknown: Vec<&str> = selection
                .iter()
                .filter(|app| !images.contains_key(*app) && !running.contains_key(*app))
                .map(String::as_str)
                .collect();
            if !unknown.is_empty() {
                return Err(StoolError::UnknownApp {
                    stage: self.name.clone(),
                    apps: unknown.join(", "),
                });
            }
            let mut apps = Vec::new();
            for app in selection {
                if running.contains_key(app) {
                    apps.push(app.clone());
                } else {
                    outcome.warn(format!("{}: {}: app is not running", self.name, app));
                }
            }
            apps
        };

        let engine = self.session.engine();
        for app in &apps {
            if let Some(id) = running.get(app) {
                info!("{}: stopping {} ({})", self.name, app, id);
                engine.stop_container(id, STOP_TIMEOUT)?;
                self.session.with_pool(|pool| Ok(pool.release(&self.name, app)))?;
            }
        }
        Ok(outcome)
    }

    /// Delete containers, images, port allocations and the stage directory.
    ///
    /// The directory goes last: if wiping the engine resources fails, it is
    /// kept.
    pub fn remove(self) -> Result<()> {
        let engine = self.session.engine();
        let labels = self.labels();
        for id in engine.list_containers(&labels, true)? {
            engine.stop_container(&id, STOP_TIMEOUT)?;
        }
        for id in engine.list_containers(&labels, false)? {
            engine.remove_container(&id)?;
        }
        for image in engine.list_images(&labels)? {
            engine.remove_image(&image.id, true)?;
        }
        self.session.with_pool(|pool| Ok(pool.release_stage(&self.name)))?;
        self.session.store().delete(&self.name)?;
        info!("{}: removed", self.name);
        Ok(())
    }

    /// Block until all running apps report they are started
    pub fn await_startup(&self, probe: &dyn ManagementProbe, policy: &StartupPolicy) -> Result<()> {
        let running = self.running()?;
        let apps: BTreeMap<String, Ports> = self
            .ports()?
            .into_iter()
            .filter(|(app, ports)| running.contains_key(app) && ports.jmxmp.is_some())
            .collect();
        startup::await_startup(&self.name, &apps, probe, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::faulty::FaultyEngine;
    use crate::engine::{Engine, LocalEngine};
    use crate::pool::NoProbe;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        session: Session,
    }

    fn fixture(adjust: impl FnOnce(&mut Settings)) -> Fixture {
        fixture_with(Arc::new(LocalEngine::in_memory()), adjust)
    }

    fn fixture_with(engine: Arc<dyn Engine>, adjust: impl FnOnce(&mut Settings)) -> Fixture {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.stages = dir.path().join("stages");
        settings.certificates = dir.path().join("certificates");
        settings.secrets = dir.path().join("secrets");
        settings.port_first = 9000;
        settings.port_last = 9099;
        settings.hostname = "localhost".to_string();
        adjust(&mut settings);
        let session = Session::new(Arc::new(settings), engine).with_port_probe(Arc::new(NoProbe));
        fs::write(dir.path().join("app.war"), b"war").unwrap();
        fs::write(dir.path().join("app.jar"), b"jar").unwrap();
        Fixture { dir, session }
    }

    impl Fixture {
        fn options(&self, app: &str, keep: usize) -> BuildOptions {
            BuildOptions {
                app: app.to_string(),
                artifact: self.dir.path().join("app.war"),
                keep,
                who: "alice".to_string(),
                ..Default::default()
            }
        }
    }

    fn build(stage: &mut Stage, options: &BuildOptions) -> Image {
        match stage.build(options).unwrap() {
            BuildOutcome::Built { image, .. } => image,
            BuildOutcome::Failed { summary, .. } => panic!("build failed: {}", summary),
        }
    }

    fn select(apps: &[&str]) -> StartRequest {
        StartRequest {
            selection: apps.iter().map(|app| (app.to_string(), 0)).collect(),
            ..Default::default()
        }
    }

    fn containers(stage: &Stage, app: &str) -> usize {
        stage
            .session
            .engine()
            .list_containers(&stage.app_labels(app), false)
            .unwrap()
            .len()
    }

    #[test]
    fn test_build_records_image() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        let mut options = f.options("web", 0);
        options.comment = "first".to_string();
        let image = build(&mut stage, &options);

        assert_eq!(image.app, "web");
        assert_eq!(image.memory, 1024);
        assert_eq!(image.comment, "first");
        assert_eq!(image.created_by, "alice");
        assert_eq!(image.ports.jmxmp, Some(5555));
        assert!(image.tag.as_deref().unwrap_or_default().starts_with("stool/s1/web:"));
        assert!(f.session.store().logs_dir("s1").join("build-web.log").is_file());
    }

    #[test]
    fn test_build_failure_is_an_outcome() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        let mut options = f.options("web", 0);
        options.artifact = f.dir.path().join("app.jar");
        options.args.insert("java".to_string(), "17\nBOGUS".to_string());

        match stage.build(&options).unwrap() {
            BuildOutcome::Failed { summary, output } => {
                assert!(summary.contains("BOGUS"));
                assert!(output.contains("Step 1/"));
            }
            BuildOutcome::Built { .. } => panic!("build should fail"),
        }
        assert!(stage.images().unwrap().is_empty());
    }

    #[test]
    fn test_build_retention() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        let mut newest = None;
        for _ in 0..3 {
            newest = Some(build(&mut stage, &f.options("web", 2)).id);
        }
        let images = stage.images().unwrap();
        assert_eq!(images["web"].len(), 2);
        assert_eq!(Some(images["web"][0].id.clone()), newest);
    }

    #[test]
    fn test_start_allocates_and_labels() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("web", 0));

        let outcome = stage.start(&StartRequest::default()).unwrap();
        assert_eq!(stage.state().unwrap(), State::Up);
        // no keystore in the certificates dir
        assert_eq!(outcome.warnings.len(), 1);

        let ports = stage.ports().unwrap()["web"];
        assert_eq!(ports.assigned().count(), 4);
        let current = stage.current_map().unwrap();
        let id = current["web"].container.clone().unwrap();
        let info = f.session.engine().inspect_container(&id).unwrap();
        assert_eq!(info.name, "web.s1.localhost");
        assert_eq!(info.memory_bytes, 1024 * MB);
        assert_eq!(info.ports.get(&8080), ports.http.as_ref());
        assert_eq!(Ports::from_labels(&info.labels, LABEL_HOST_PORT_PREFIX).unwrap(), ports);

        let urls = stage.urls().unwrap();
        assert_eq!(urls["web"][0], format!("http://web.s1.localhost:{}/", ports.http.unwrap()));
    }

    #[test]
    fn test_start_explicit_port() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("web", 0));
        let mut request = StartRequest::default();
        request.ports.insert(
            "web".to_string(),
            PortRequest {
                http: Some(9050),
                https: None,
            },
        );
        stage.start(&request).unwrap();
        assert_eq!(stage.ports().unwrap()["web"].http, Some(9050));
    }

    #[test]
    fn test_start_skips_running_apps() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("x", 0));
        build(&mut stage, &f.options("y", 0));

        stage.start(&select(&["x"])).unwrap();
        let outcome = stage.start(&select(&["x", "y"])).unwrap();
        assert!(outcome.warnings.iter().any(|w| w.contains("x: app already running")));
        assert_eq!(containers(&stage, "x"), 1);
        assert_eq!(containers(&stage, "y"), 1);
        assert!(stage.current_map().unwrap().values().all(Current::is_running));
    }

    #[test]
    fn test_start_rejects_bad_selection() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        assert!(matches!(
            stage.start(&StartRequest::default()),
            Err(StoolError::NothingBuilt { .. })
        ));

        build(&mut stage, &f.options("web", 0));
        match stage.start(&select(&["web", "nope"])) {
            Err(StoolError::UnknownApp { apps, .. }) => assert_eq!(apps, "nope"),
            other => panic!("unexpected: {:?}", other),
        }
        let request = StartRequest {
            selection: vec![("web".to_string(), 3)],
            ..Default::default()
        };
        assert!(matches!(stage.start(&request), Err(StoolError::AppIndex { index: 3, .. })));
        assert_eq!(stage.state().unwrap(), State::Down);
    }

    #[test]
    fn test_start_checks_memory_before_anything() {
        let f = fixture(|s| s.memory_quota = 1500);
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("api", 0));
        build(&mut stage, &f.options("web", 0));

        match stage.start(&StartRequest::default()) {
            Err(StoolError::MemoryExhausted {
                app,
                requested,
                unreserved,
                ..
            }) => {
                assert_eq!(app, "web");
                assert_eq!(requested, 1024);
                assert_eq!(unreserved, 476);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(stage.state().unwrap(), State::Down);
        assert!(stage.ports().unwrap().is_empty());
    }

    #[test]
    fn test_start_refuses_expired_stage() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("web", 0));
        let expire = BTreeMap::from([("expire".to_string(), "2000-01-01".to_string())]);
        stage.set_config(&expire, "bob").unwrap();
        assert!(matches!(
            stage.start(&StartRequest::default()),
            Err(StoolError::Expired { .. })
        ));
    }

    #[test]
    fn test_stop() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("x", 0));
        build(&mut stage, &f.options("y", 0));
        assert!(matches!(stage.stop(&[]), Err(StoolError::AlreadyStopped(_))));

        stage.start(&select(&["x"])).unwrap();
        assert!(matches!(
            stage.stop(&["nope".to_string()]),
            Err(StoolError::UnknownApp { .. })
        ));
        let outcome = stage.stop(&["x".to_string(), "y".to_string()]).unwrap();
        assert_eq!(outcome.warnings, vec!["s1: y: app is not running".to_string()]);
        assert_eq!(stage.state().unwrap(), State::Down);
        assert!(stage.ports().unwrap().is_empty());
        assert!(matches!(stage.stop(&[]), Err(StoolError::AlreadyStopped(_))));

        // restart replaces the stopped container
        stage.start(&select(&["x"])).unwrap();
        assert_eq!(containers(&stage, "x"), 1);
    }

    #[test]
    fn test_remove() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("web", 0));
        stage.start(&StartRequest::default()).unwrap();

        stage.remove().unwrap();
        let engine = f.session.engine();
        let labels = labels::stage_labels("stool", "s1");
        assert!(engine.list_containers(&labels, false).unwrap().is_empty());
        assert!(engine.list_images(&labels).unwrap().is_empty());
        assert!(!f.session.store().exists("s1"));
        assert!(f.session.with_pool(|pool| Ok(pool.allocations().is_empty())).unwrap());
    }

    #[test]
    fn test_start_failure_releases_ports_and_container() {
        let engine = Arc::new(FaultyEngine::default());
        let f = fixture_with(engine.clone(), |_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("web", 0));

        engine.report_status(Some(ContainerStatus::Created));
        match stage.start(&StartRequest::default()) {
            Err(StoolError::ContainerStatus { app, status, .. }) => {
                assert_eq!(app, "web");
                assert_eq!(status, "created");
            }
            other => panic!("unexpected: {:?}", other),
        }
        engine.report_status(None);

        assert!(stage.ports().unwrap().is_empty());
        assert_eq!(containers(&stage, "web"), 0);
        assert_eq!(stage.state().unwrap(), State::Down);

        stage.start(&StartRequest::default()).unwrap();
        assert_eq!(stage.state().unwrap(), State::Up);
    }

    #[test]
    fn test_remove_keeps_directory_when_engine_fails() {
        let engine = Arc::new(FaultyEngine::default());
        let f = fixture_with(engine.clone(), |_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("web", 0));
        stage.start(&StartRequest::default()).unwrap();

        engine.fail_removals(true);
        assert!(matches!(stage.remove(), Err(StoolError::Engine(_))));
        assert!(f.session.store().exists("s1"));

        engine.fail_removals(false);
        f.session.load_stage("s1").unwrap().remove().unwrap();
        assert!(!f.session.store().exists("s1"));
    }

    #[test]
    fn test_keystore_is_mounted_when_present() {
        let f = fixture(|_| {});
        let certificates = &f.session.settings().certificates;
        fs::create_dir_all(certificates).unwrap();
        fs::write(certificates.join("web.s1.p12"), b"p12").unwrap();
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        build(&mut stage, &f.options("web", 0));

        let outcome = stage.start(&StartRequest::default()).unwrap();
        assert!(outcome.is_clean());
        let id = stage.current_map().unwrap()["web"].container.clone().unwrap();
        let info = f.session.engine().inspect_container(&id).unwrap();
        assert!(info
            .mounts
            .iter()
            .any(|m| m.container_path == KEYSTORE_MOUNT && m.read_only));
    }

    #[test]
    fn test_secrets_must_exist() {
        let f = fixture(|_| {});
        let mut stage = f.session.create_stage("s1", "alice").unwrap();
        let mut options = f.options("web", 0);
        options.secrets.insert("shared".to_string(), "/etc/shared".to_string());
        build(&mut stage, &options);

        assert!(matches!(
            stage.start(&StartRequest::default()),
            Err(StoolError::InvalidConfig(_))
        ));
        assert!(stage.ports().unwrap().is_empty());

        fs::create_dir_all(f.session.settings().secrets.join("shared")).unwrap();
        stage.start(&StartRequest::default()).unwrap();
        let id = stage.current_map().unwrap()["web"].container.clone().unwrap();
        let info = f.session.engine().inspect_container(&id).unwrap();
        assert!(info
            .mounts
            .iter()
            .any(|m| m.container_path == "/etc/shared" && m.read_only));
    }
}
