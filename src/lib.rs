//! Stool - stage tool for containerized web applications
//!
//! Stool manages stages: named deployments of one or more apps. It provides:
//!
//! - A port pool handing out collision free http/https/jmxmp/debug ports
//! - The stage lifecycle: build, start, stop, remove and startup polling
//! - Memory and disk accounting across all stages
//! - A validation sweep that reports and repairs expired or oversized stages

pub mod accounting;
pub mod config;
pub mod engine;
pub mod error;
pub mod outcome;
pub mod pool;
pub mod session;
pub mod stage;
pub mod validation;

pub use error::{Result, StoolError};
pub use session::Session;
