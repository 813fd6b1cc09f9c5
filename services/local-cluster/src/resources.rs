//! Scalar resource sets.
//!
//! Resources travel through configuration as one composite string, e.g.
//! `cpus:1;mem:512;disk:1024`. Quantities are plain numbers; `mem` and
//! `disk` are megabytes.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{AddAssign, SubAssign};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CPUS: &str = "cpus";
pub const MEM: &str = "mem";
pub const DISK: &str = "disk";

/// Errors from parsing a resource string.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourcesError {
    #[error("resource '{0}' is missing ':'")]
    MissingSeparator(String),

    #[error("resource name cannot be empty")]
    EmptyName,

    #[error("resource '{name}' has invalid quantity '{value}'")]
    InvalidQuantity { name: String, value: String },

    #[error("resource '{0}' is specified more than once")]
    Duplicate(String),
}

/// A set of named scalar quantities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    scalars: BTreeMap<String, f64>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the standard `cpus`/`mem`/`disk` triple.
    pub fn from_parts(cpus: f64, mem: u64, disk: u64) -> Self {
        let mut resources = Self::new();
        resources.scalars.insert(CPUS.to_string(), cpus);
        resources.scalars.insert(MEM.to_string(), mem as f64);
        resources.scalars.insert(DISK.to_string(), disk as f64);
        resources
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.scalars.insert(name.into(), value);
    }

    pub fn cpus(&self) -> f64 {
        self.get(CPUS).unwrap_or(0.0)
    }

    pub fn mem(&self) -> f64 {
        self.get(MEM).unwrap_or(0.0)
    }

    pub fn disk(&self) -> f64 {
        self.get(DISK).unwrap_or(0.0)
    }

    /// True if every quantity in `other` fits within this set.
    pub fn contains(&self, other: &Resources) -> bool {
        other
            .scalars
            .iter()
            .all(|(name, value)| self.get(name).unwrap_or(0.0) >= *value)
    }

    /// True if no quantity is positive.
    pub fn is_empty(&self) -> bool {
        self.scalars.values().all(|v| *v <= 0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.scalars.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, rhs: &Resources) {
        for (name, value) in &rhs.scalars {
            *self.scalars.entry(name.clone()).or_insert(0.0) += value;
        }
    }
}

impl SubAssign<&Resources> for Resources {
    /// Subtracts quantity by quantity, never going below zero.
    fn sub_assign(&mut self, rhs: &Resources) {
        for (name, value) in &rhs.scalars {
            if let Some(current) = self.scalars.get_mut(name) {
                *current = (*current - value).max(0.0);
            }
        }
    }
}

impl FromStr for Resources {
    type Err = ResourcesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut scalars = BTreeMap::new();

        for item in s.split(';').map(str::trim).filter(|item| !item.is_empty()) {
            let (name, value) = item
                .split_once(':')
                .ok_or_else(|| ResourcesError::MissingSeparator(item.to_string()))?;

            let name = name.trim();
            if name.is_empty() {
                return Err(ResourcesError::EmptyName);
            }

            let quantity = value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|q| q.is_finite() && *q >= 0.0)
                .ok_or_else(|| ResourcesError::InvalidQuantity {
                    name: name.to_string(),
                    value: value.to_string(),
                })?;

            if scalars.insert(name.to_string(), quantity).is_some() {
                return Err(ResourcesError::Duplicate(name.to_string()));
            }
        }

        Ok(Self { scalars })
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.scalars.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}:{}", name, value)?;
        }
        Ok(())
    }
}

impl Serialize for Resources {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Resources {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_standard_triple() {
        let r: Resources = "cpus:1;mem:512;disk:1024".parse().unwrap();
        assert_eq!(r.cpus(), 1.0);
        assert_eq!(r.mem(), 512.0);
        assert_eq!(r.disk(), 1024.0);
    }

    #[test]
    fn test_display_matches_launch_format() {
        let r = Resources::from_parts(1.0, 512, 1024);
        assert_eq!(r.to_string(), "cpus:1;disk:1024;mem:512");

        let r = Resources::from_parts(0.5, 64, 0);
        assert_eq!(r.to_string(), "cpus:0.5;disk:0;mem:64");
    }

    #[test]
    fn test_parse_tolerates_whitespace_and_trailing_separator() {
        let r: Resources = " cpus : 2 ; mem:128 ;".parse().unwrap();
        assert_eq!(r.cpus(), 2.0);
        assert_eq!(r.mem(), 128.0);
    }

    #[test]
    fn test_empty_string_is_empty_set() {
        let r: Resources = "".parse().unwrap();
        assert!(r.is_empty());
        assert_eq!(r.to_string(), "");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "cpus".parse::<Resources>().unwrap_err(),
            ResourcesError::MissingSeparator("cpus".to_string())
        );
        assert_eq!(":1".parse::<Resources>().unwrap_err(), ResourcesError::EmptyName);
        assert!(matches!(
            "mem:lots".parse::<Resources>().unwrap_err(),
            ResourcesError::InvalidQuantity { .. }
        ));
        assert!(matches!(
            "mem:-1".parse::<Resources>().unwrap_err(),
            ResourcesError::InvalidQuantity { .. }
        ));
        assert!(matches!(
            "cpus:inf".parse::<Resources>().unwrap_err(),
            ResourcesError::InvalidQuantity { .. }
        ));
        assert_eq!(
            "cpus:1;cpus:2".parse::<Resources>().unwrap_err(),
            ResourcesError::Duplicate("cpus".to_string())
        );
    }

    #[test]
    fn test_arithmetic() {
        let mut total = Resources::from_parts(4.0, 1024, 2048);
        let used = Resources::from_parts(1.0, 256, 4096);

        assert!(!total.contains(&used));
        total -= &used;
        assert_eq!(total.cpus(), 3.0);
        assert_eq!(total.mem(), 768.0);
        assert_eq!(total.disk(), 0.0);

        total += &used;
        assert_eq!(total.cpus(), 4.0);
        assert!(total.contains(&Resources::from_parts(4.0, 1024, 4096)));
    }

    proptest! {
        #[test]
        fn prop_display_parses_back(
            cpus in 0u32..64,
            mem in 0u64..1_000_000,
            disk in 0u64..1_000_000,
        ) {
            let r = Resources::from_parts(cpus as f64 / 4.0, mem, disk);
            prop_assert_eq!(r.to_string().parse::<Resources>().unwrap(), r);
        }
    }
}
