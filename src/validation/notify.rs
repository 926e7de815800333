//! Delivery of validation reports

use super::report::Report;
use crate::error::Result;
use tracing::{error, info, warn};

pub const SUBJECT: &str = "Stool validation report";

/// Sends messages to one recipient
pub trait Notifier {
    fn notify(&self, recipient: &str, subject: &str, messages: &[String]) -> Result<()>;
}

/// Writes reports to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, recipient: &str, subject: &str, messages: &[String]) -> Result<()> {
        info!("{} for {}:", subject, recipient);
        for message in messages {
            info!("  {}", message);
        }
        Ok(())
    }
}

/// Send every recipient its messages; admin messages go to `admin`.
/// Returns the number of recipients notified.
pub fn deliver(report: &Report, admin: &str, notifier: &dyn Notifier) -> usize {
    let mut delivered = 0;
    for recipient in report.recipients() {
        let messages = report.messages(recipient);
        let to = recipient.as_deref().unwrap_or(admin);
        if to.is_empty() {
            warn!("No admin configured, dropping {} message(s)", messages.len());
            continue;
        }
        match notifier.notify(to, SUBJECT, messages) {
            Ok(()) => delivered += 1,
            Err(e) => error!("Failed to notify {}: {}", to, e),
        }
    }
    delivered
}
