//! Statically known property tables
//!
//! Every configurable record exposes its properties as a `&'static [Property<T>]`.
//! A property is a name plus a getter and a validating setter, so the
//! whole surface is enumerable and testable without runtime type inspection.

use crate::error::{Result, StoolError};
use std::collections::BTreeMap;

/// A named, typed accessor on a configuration record
pub struct Property<T: 'static> {
    /// Property name as used on the command line and in env variables
    pub name: &'static str,
    /// Render the current value
    pub get: fn(&T) -> String,
    /// Parse, validate and store a new value
    pub set: fn(&mut T, &str) -> Result<()>,
}

impl<T> Property<T> {
    /// Environment variable name for this property, e.g. `port_first` -> `STOOL_PORT_FIRST`
    pub fn env_name(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.name.replace(['.', '-'], "_").to_uppercase())
    }
}

/// Find a property by name
pub fn lookup<'a, T>(table: &'a [Property<T>], name: &str) -> Result<&'a Property<T>> {
    table
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| StoolError::UnknownProperty {
            name: name.to_string(),
            choices: table.iter().map(|p| p.name).collect::<Vec<_>>().join(", "),
        })
}

/// Render all properties of a record
pub fn get_all<T>(table: &[Property<T>], target: &T) -> BTreeMap<String, String> {
    table
        .iter()
        .map(|p| (p.name.to_string(), (p.get)(target)))
        .collect()
}

/// Apply `name=value` assignments; either all succeed or the target is untouched
pub fn set_all<T: Clone>(
    table: &[Property<T>],
    target: &mut T,
    assignments: &BTreeMap<String, String>,
) -> Result<()> {
    let mut patched = target.clone();
    for (name, value) in assignments {
        let property = lookup(table, name)?;
        (property.set)(&mut patched, value)?;
    }
    *target = patched;
    Ok(())
}

/// Parse helper shared by the tables
pub fn parse<V: std::str::FromStr>(name: &str, value: &str) -> Result<V>
where
    V::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<V>()
        .map_err(|e| StoolError::InvalidProperty {
            name: name.to_string(),
            message: format!("{}: {}", value, e),
        })
}

/// Comma separated list
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Comma separated `key=value` pairs
pub fn parse_map(name: &str, value: &str) -> Result<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();
    for item in parse_list(value) {
        let (key, val) = item.split_once('=').ok_or_else(|| StoolError::InvalidProperty {
            name: name.to_string(),
            message: format!("expected key=value, got {}", item),
        })?;
        result.insert(key.trim().to_string(), val.trim().to_string());
    }
    Ok(result)
}

/// Inverse of [`parse_map`]
pub fn format_map(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Sample {
        count: u32,
        tags: Vec<String>,
    }

    static SAMPLE: &[Property<Sample>] = &[
        Property {
            name: "count",
            get: |s| s.count.to_string(),
            set: |s, v| {
                s.count = parse("count", v)?;
                Ok(())
            },
        },
        Property {
            name: "tags",
            get: |s| s.tags.join(","),
            set: |s, v| {
                s.tags = parse_list(v);
                Ok(())
            },
        },
    ];

    #[test]
    fn test_lookup_unknown_lists_choices() {
        let err = lookup(SAMPLE, "nope").err().unwrap();
        assert!(err.to_string().contains("count, tags"));
    }

    #[test]
    fn test_set_all_is_atomic() {
        let mut sample = Sample::default();
        let mut assignments = BTreeMap::new();
        assignments.insert("tags".to_string(), "a, b".to_string());
        assignments.insert("count".to_string(), "x".to_string());

        assert!(set_all(SAMPLE, &mut sample, &assignments).is_err());
        assert!(sample.tags.is_empty());

        assignments.insert("count".to_string(), "7".to_string());
        set_all(SAMPLE, &mut sample, &assignments).unwrap();
        assert_eq!(sample.count, 7);
        assert_eq!(get_all(SAMPLE, &sample)["tags"], "a,b");
    }

    #[test]
    fn test_env_name() {
        assert_eq!(SAMPLE[0].env_name("STOOL"), "STOOL_COUNT");
    }

    #[test]
    fn test_parse_map() {
        let map = parse_map("env", "A=1, B = two").unwrap();
        assert_eq!(map["A"], "1");
        assert_eq!(map["B"], "two");
        assert_eq!(format_map(&map), "A=1,B=two");
        assert!(parse_map("env", "broken").is_err());
    }
}
