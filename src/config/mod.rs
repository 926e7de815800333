//! Configuration module
//!
//! Process-wide settings, the per-stage expiry type and the explicit
//! property tables used to read and write configuration by name.

pub mod expire;
pub mod property;
pub mod settings;

pub use expire::Expire;
pub use property::Property;
pub use settings::{Settings, NOTIFY_CREATED_BY, NOTIFY_LAST_MODIFIED_BY};
