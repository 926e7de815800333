//! Stage module
//!
//! Configuration, directories, images and the lifecycle of a stage.

pub mod config;
pub mod image;
pub mod lifecycle;
pub mod startup;
pub mod store;
pub mod template;

pub use config::StageConfig;
pub use image::{Current, Image};
pub use lifecycle::{BuildOptions, BuildOutcome, PortRequest, Stage, StartRequest, State};
pub use startup::{JolokiaProbe, ManagementProbe, StartupPolicy};
pub use store::StageStore;
