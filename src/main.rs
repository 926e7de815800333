//! Stool - stage tool
//!
//! This is the main CLI entry point for Stool.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stool::config::Settings;
use stool::outcome::{run_batch, BatchReport, FailMode, Outcome};
use stool::stage::{
    BuildOptions, BuildOutcome, JolokiaProbe, PortRequest, StartRequest, StartupPolicy,
};
use stool::validation::{deliver, LogNotifier, SystemResolver, Validation};
use stool::Session;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Stool - build, start and stop stages
#[derive(Parser)]
#[command(name = "stool")]
#[command(version)]
#[command(about = "Stage tool: build, start and stop stages of web applications", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Settings file
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// How to continue when a command fails for one of several stages
    #[arg(long, global = true, value_enum, default_value = "abort")]
    fail: Fail,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Fail {
    /// Stop at the first failing stage
    Abort,
    /// Process all stages, report failures at the end
    After,
    /// Process all stages, ignore failures
    Never,
}

impl From<Fail> for FailMode {
    fn from(fail: Fail) -> Self {
        match fail {
            Fail::Abort => FailMode::AbortFirst,
            Fail::After => FailMode::CollectAll,
            Fail::Never => FailMode::Ignore,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a stage
    Create {
        /// Stage name
        name: String,
        /// Initial properties
        #[arg(value_parser = parse_key_val)]
        properties: Vec<(String, String)>,
    },

    /// Build an image for an app of a stage
    Build {
        /// Stage name
        stage: String,
        /// War or jar file
        artifact: PathBuf,
        /// App name
        #[arg(short, long, default_value = "app")]
        app: String,
        /// Build template
        #[arg(short, long)]
        template: Option<String>,
        /// Template variable
        #[arg(long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,
        /// Secret project to mount, project=container path
        #[arg(long = "secret", value_parser = parse_key_val)]
        secrets: Vec<(String, String)>,
        /// Do not use cache when building the image
        #[arg(long)]
        no_cache: bool,
        /// Images to keep for this app, including the new one
        #[arg(short, long, default_value = "0")]
        keep: usize,
        /// Comment for the image
        #[arg(short, long, default_value = "")]
        comment: String,
        /// Where the artifact comes from
        #[arg(long)]
        origin: Option<String>,
    },

    /// Start stages
    Start {
        /// Stage names
        #[arg(required = true)]
        stages: Vec<String>,
        /// App to start, optionally with image index (app:idx)
        #[arg(short, long)]
        app: Vec<String>,
        /// Explicit http port (app=port)
        #[arg(long, value_parser = parse_key_val)]
        http: Vec<(String, String)>,
        /// Explicit https port (app=port)
        #[arg(long, value_parser = parse_key_val)]
        https: Vec<(String, String)>,
        /// Environment variable
        #[arg(short, long, value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        /// Wait until the apps are started
        #[arg(short, long)]
        wait: bool,
    },

    /// Stop stages
    Stop {
        /// Stage names
        #[arg(required = true)]
        stages: Vec<String>,
        /// App to stop
        #[arg(short, long)]
        app: Vec<String>,
    },

    /// Remove stages with all images and containers
    Remove {
        /// Stage names
        #[arg(required = true)]
        stages: Vec<String>,
    },

    /// Show the status of a stage
    Status {
        /// Stage name
        stage: String,
    },

    /// List stages
    List,

    /// List the images of a stage
    Images {
        /// Stage name
        stage: String,
    },

    /// List port allocations
    Ports,

    /// Get or set stage properties
    Config {
        /// Stage name
        stage: String,
        /// `name` to get, `name=value` to set; nothing to show all
        properties: Vec<String>,
    },

    /// Show settings
    Settings,

    /// Check all stages for expiry and quota
    Validate {
        /// Regex selecting stages
        #[arg(short, long)]
        stage: Option<String>,
        /// Stop and remove stages that violate constraints
        #[arg(short, long)]
        repair: bool,
        /// Repeat every given number of seconds
        #[arg(long)]
        every: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Arc::new(Settings::load(cli.settings.as_deref()).context("cannot load settings")?);
    let mode = FailMode::from(cli.fail);

    match cli.command {
        Commands::Validate {
            stage,
            repair,
            every: Some(seconds),
        } => {
            let selector = selector(stage)?;
            let mut interval = tokio::time::interval(Duration::from_secs(seconds.max(1)));
            loop {
                interval.tick().await;
                let settings = settings.clone();
                let selector = selector.clone();
                if let Err(e) = blocking(move || validate(&settings, selector.as_ref(), repair)).await {
                    error!("validation failed: {:#}", e);
                }
            }
        }
        command => blocking(move || run(&settings, command, mode)).await,
    }
}

/// Run `f` on a blocking worker; all stool operations block
async fn blocking<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.context("worker failed")?
}

fn run(settings: &Arc<Settings>, command: Commands, mode: FailMode) -> anyhow::Result<()> {
    let session = Session::open(settings.clone()).context("cannot open engine state")?;
    let who = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());

    match command {
        Commands::Create { name, properties } => {
            let mut stage = session.create_stage(&name, &who)?;
            if !properties.is_empty() {
                stage.set_config(&properties.into_iter().collect(), &who)?;
            }
            println!("stage {} created", name);
        }

        Commands::Build {
            stage,
            artifact,
            app,
            template,
            args,
            secrets,
            no_cache,
            keep,
            comment,
            origin,
        } => {
            let mut stage = session.load_stage(&stage)?;
            let options = BuildOptions {
                app,
                origin: origin.unwrap_or_else(|| artifact.display().to_string()),
                artifact,
                template,
                args: args.into_iter().collect(),
                secrets: secrets.into_iter().collect(),
                no_cache,
                keep,
                comment,
                who: who.clone(),
                created_on: gethostname::gethostname().to_string_lossy().to_string(),
            };
            match stage.build(&options)? {
                BuildOutcome::Built { image, output } => {
                    print!("{}", output);
                    println!("{}: built {} ({})", stage.name(), image.app, image.tag.unwrap_or(image.id));
                }
                BuildOutcome::Failed { summary, output } => {
                    eprint!("{}", output);
                    bail!("{}: build failed: {}", stage.name(), summary);
                }
            }
        }

        Commands::Start {
            stages,
            app,
            http,
            https,
            env,
            wait,
        } => {
            let request = StartRequest {
                selection: app.iter().map(|a| parse_selection(a)).collect::<anyhow::Result<_>>()?,
                ports: port_requests(&http, &https)?,
                environment: env.into_iter().collect(),
            };
            let report = run_batch(&stages, mode, |name| {
                let mut stage = session.load_stage(name)?;
                let outcome = stage.start(&request)?;
                if wait {
                    let probe = JolokiaProbe::new(&settings.hostname)?;
                    stage.await_startup(&probe, &StartupPolicy::default())?;
                }
                for (app, urls) in stage.urls()? {
                    println!("{}: {}: {}", name, app, urls.join(" "));
                }
                Ok(outcome)
            })?;
            finish(report)?;
        }

        Commands::Stop { stages, app } => {
            let report = run_batch(&stages, mode, |name| session.load_stage(name)?.stop(&app))?;
            finish(report)?;
        }

        Commands::Remove { stages } => {
            let report = run_batch(&stages, mode, |name| {
                session.load_stage(name)?.remove()?;
                println!("{}: removed", name);
                Ok(Outcome::new())
            })?;
            finish(report)?;
        }

        Commands::Status { stage } => {
            let stage = session.load_stage(&stage)?;
            println!("{:<20} {}", "name", stage.name());
            println!("{:<20} {}", "state", stage.state()?);
            for (name, value) in stage.config().properties() {
                println!("{:<20} {}", name, value);
            }
            let ports = stage.ports()?;
            for (app, current) in stage.current_map()? {
                println!(
                    "{:<20} {} {} {}",
                    format!("app {}", app),
                    current.image.tag.as_deref().unwrap_or(&current.image.id),
                    current.container.as_deref().unwrap_or("-"),
                    ports.get(&app).map(|p| p.to_string()).unwrap_or_default()
                );
            }
            for (app, urls) in stage.urls()? {
                println!("{:<20} {}", format!("urls {}", app), urls.join(" "));
            }
            let accounting = session.accounting();
            println!("{:<20} {} mb", "disk", accounting.disk_used(stage.name())?);
            match accounting.memory_unreserved()? {
                Some(mb) => println!("{:<20} {} mb", "memory unreserved", mb),
                None => println!("{:<20} unlimited", "memory unreserved"),
            }
        }

        Commands::List => {
            println!("{:<30} {:<6} {:<12}", "STAGE", "STATE", "EXPIRE");
            for name in session.list_stages()? {
                let stage = session.load_stage(&name)?;
                println!("{:<30} {:<6} {:<12}", name, stage.state()?.to_string(), stage.config().expire.to_string());
            }
        }

        Commands::Images { stage } => {
            let stage = session.load_stage(&stage)?;
            println!(
                "{:<10} {:<4} {:<40} {:<20} {:<8} {:<12} {}",
                "APP", "IDX", "TAG", "CREATED", "MEMORY", "CREATED BY", "COMMENT"
            );
            for (app, images) in stage.images()? {
                for (idx, image) in images.iter().enumerate() {
                    println!(
                        "{:<10} {:<4} {:<40} {:<20} {:<8} {:<12} {}",
                        app,
                        idx,
                        image.tag.as_deref().unwrap_or(&image.id[..12.min(image.id.len())]),
                        image.created.format("%Y-%m-%d %H:%M:%S"),
                        image.memory,
                        image.created_by,
                        image.comment
                    );
                }
            }
        }

        Commands::Ports => {
            let allocations = session.with_pool(|pool| Ok(pool.allocations().to_vec()))?;
            println!("{:<30} {:<10} {}", "STAGE", "APP", "PORTS");
            for allocation in allocations {
                println!("{:<30} {:<10} {}", allocation.stage, allocation.app, allocation.ports);
            }
        }

        Commands::Config { stage, properties } => {
            let mut stage = session.load_stage(&stage)?;
            if properties.is_empty() {
                for (name, value) in stage.config().properties() {
                    println!("{} = {}", name, value);
                }
            } else if properties.iter().all(|p| p.contains('=')) {
                let assignments = properties
                    .iter()
                    .map(|p| parse_key_val(p).map_err(anyhow::Error::msg))
                    .collect::<anyhow::Result<BTreeMap<_, _>>>()?;
                stage.set_config(&assignments, &who)?;
                for name in assignments.keys() {
                    println!("{} = {}", name, stage.config().get(name)?);
                }
            } else {
                for name in &properties {
                    println!("{} = {}", name, stage.config().get(name)?);
                }
            }
        }

        Commands::Settings => {
            for (name, value) in settings.properties() {
                println!("{} = {}", name, value);
            }
        }

        Commands::Validate { stage, repair, .. } => {
            validate(settings, selector(stage)?.as_ref(), repair)?;
        }
    }

    Ok(())
}

fn validate(settings: &Arc<Settings>, selector: Option<&Regex>, repair: bool) -> anyhow::Result<()> {
    let session = Session::open(settings.clone())?;
    let report = Validation::new(&session, &SystemResolver).run(selector, repair)?;
    for message in report.all() {
        println!("{}", message);
    }
    deliver(&report, &settings.admin, &LogNotifier);
    Ok(())
}

fn finish(report: BatchReport) -> anyhow::Result<()> {
    for warning in report.warnings() {
        eprintln!("warning: {}", warning);
    }
    for (stage, e) in &report.failed {
        eprintln!("{}: {}", stage, e);
    }
    if !report.is_success() {
        bail!("{} stage(s) failed", report.failed.len());
    }
    Ok(())
}

fn selector(stage: Option<String>) -> anyhow::Result<Option<Regex>> {
    stage
        .map(|s| Regex::new(&s))
        .transpose()
        .context("invalid stage selector")
}

/// Parse a `key=value` argument
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {}", s))
}

/// Parse `app` or `app:index`
fn parse_selection(s: &str) -> anyhow::Result<(String, usize)> {
    match s.split_once(':') {
        None => Ok((s.to_string(), 0)),
        Some((app, index)) => Ok((
            app.to_string(),
            index.parse().with_context(|| format!("invalid image index: {}", s))?,
        )),
    }
}

fn port_requests(
    http: &[(String, String)],
    https: &[(String, String)],
) -> anyhow::Result<BTreeMap<String, PortRequest>> {
    let mut result: BTreeMap<String, PortRequest> = BTreeMap::new();
    for (app, port) in http {
        result.entry(app.clone()).or_default().http =
            Some(port.parse().with_context(|| format!("invalid http port: {}", port))?);
    }
    for (app, port) in https {
        result.entry(app.clone()).or_default().https =
            Some(port.parse().with_context(|| format!("invalid https port: {}", port))?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection() {
        assert_eq!(parse_selection("web").unwrap(), ("web".to_string(), 0));
        assert_eq!(parse_selection("web:2").unwrap(), ("web".to_string(), 2));
        assert!(parse_selection("web:x").is_err());
    }

    #[test]
    fn test_port_requests() {
        let http = vec![("web".to_string(), "9050".to_string())];
        let https = vec![("web".to_string(), "9051".to_string())];
        let requests = port_requests(&http, &https).unwrap();
        assert_eq!(requests["web"], PortRequest { http: Some(9050), https: Some(9051) });
        assert!(port_requests(&[("web".to_string(), "x".to_string())], &[]).is_err());
    }
}
