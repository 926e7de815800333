//! Validation report
//!
//! Messages are collected per recipient. `None` is the admin.

use crate::config::{NOTIFY_CREATED_BY, NOTIFY_LAST_MODIFIED_BY};
use crate::stage::config::StageConfig;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    messages: BTreeMap<Option<String>, Vec<String>>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admin-only message
    pub fn admin(&mut self, message: impl Into<String>) {
        self.add(None, message.into());
    }

    /// Message for everybody on the notify list of a stage
    pub fn user(&mut self, config: &StageConfig, message: impl Into<String>) {
        let message = message.into();
        let recipients = recipients(config);
        if recipients.is_empty() {
            self.add(None, message);
        } else {
            for recipient in recipients {
                self.add(Some(recipient), message.clone());
            }
        }
    }

    fn add(&mut self, recipient: Option<String>, message: String) {
        let list = self.messages.entry(recipient).or_default();
        if !list.contains(&message) {
            list.push(message);
        }
    }

    /// Recipients in order, admin first
    pub fn recipients(&self) -> impl Iterator<Item = &Option<String>> {
        self.messages.keys()
    }

    pub fn messages(&self, recipient: &Option<String>) -> &[String] {
        self.messages.get(recipient).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All messages, deduplicated, in recipient order
    pub fn all(&self) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();
        for message in self.messages.values().flatten() {
            if !result.contains(message) {
                result.push(message.clone());
            }
        }
        result
    }
}

/// Resolve the notify list of a stage; unresolvable entries are dropped
fn recipients(config: &StageConfig) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for entry in &config.notify {
        let resolved = match entry.as_str() {
            NOTIFY_CREATED_BY => config.created_by.as_str(),
            NOTIFY_LAST_MODIFIED_BY => config.last_modified_by.as_str(),
            literal => literal,
        };
        if !resolved.is_empty() && !result.iter().any(|r| r == resolved) {
            result.push(resolved.to_string());
        }
    }
    result
}
