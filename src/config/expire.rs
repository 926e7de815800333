//! Stage expiry date

use crate::error::{Result, StoolError};
use chrono::{Duration, Local, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const NEVER: &str = "never";
const FORMAT: &str = "%Y-%m-%d";

/// Expiry of a stage; `None` means the stage never expires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expire(Option<NaiveDate>);

impl Expire {
    /// A stage that never expires
    pub fn never() -> Self {
        Self(None)
    }

    /// Expire on the given date
    pub fn on(date: NaiveDate) -> Self {
        Self(Some(date))
    }

    /// Parse `never`, a number of days from `today`, or `yyyy-mm-dd`
    pub fn parse_at(input: &str, today: NaiveDate) -> Result<Self> {
        let input = input.trim();
        if input == NEVER {
            return Ok(Self::never());
        }
        if let Ok(days) = input.parse::<i64>() {
            if days == 0 {
                return Ok(Self::never());
            }
            return Duration::try_days(days)
                .and_then(|delta| today.checked_add_signed(delta))
                .map(Self::on)
                .ok_or_else(|| StoolError::InvalidProperty {
                    name: "expire".to_string(),
                    message: format!("{} days is out of range", days),
                });
        }
        NaiveDate::parse_from_str(input, FORMAT)
            .map(Self::on)
            .map_err(|_| StoolError::InvalidProperty {
                name: "expire".to_string(),
                message: format!("invalid date. Expected format: yyyy-mm-dd, got {}", input),
            })
    }

    /// Parse relative to the local date
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_at(input, today())
    }

    /// The expiry date, if any
    pub fn date(&self) -> Option<NaiveDate> {
        self.0
    }

    /// Days since expiry: negative before, 0 on the last day, `None` for never
    pub fn expired_days_at(&self, today: NaiveDate) -> Option<i64> {
        self.0.map(|date| (today - date).num_days())
    }

    pub fn expired_days(&self) -> Option<i64> {
        self.expired_days_at(today())
    }

    pub fn is_expired_at(&self, today: NaiveDate) -> bool {
        self.expired_days_at(today).map_or(false, |days| days > 0)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(today())
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

impl fmt::Display for Expire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => write!(f, "{}", NEVER),
            Some(date) => write!(f, "{}", date.format(FORMAT)),
        }
    }
}

impl Serialize for Expire {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Expire {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Expire::parse(&raw).map_err(serde::de::Error::custom)
    }
}
