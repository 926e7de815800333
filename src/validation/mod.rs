//! Validation module
//!
//! Periodic check of all stages against their expiry and quota, with
//! optional repair, plus host level sanity checks reported to the admin.

pub mod notify;
pub mod report;
pub mod sweep;

pub use notify::{deliver, LogNotifier, Notifier};
pub use report::Report;
pub use sweep::{HostResolver, SystemResolver, Validation};
