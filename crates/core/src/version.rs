//! API version arithmetic.
//!
//! Versions order totally by `(major, minor, patch, label)`; an absent label
//! sorts before any label, so `1.2.3` < `1.2.3-beta` under this ordering.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A parsed API version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Pre-release label (`alpha`, `beta`, `rc1`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Version {
    #[must_use]
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch, label: None }
    }

    /// The `major.minor` short form used in resolution logs and headers.
    #[must_use]
    pub fn short(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// Whether this version can serve a request for `requested`.
    ///
    /// Same major and a minor at least as high as requested. The patch level
    /// is deliberately not considered: patch releases are assumed wire
    /// compatible in both directions.
    #[must_use]
    pub fn is_compatible_with(&self, requested: &Version) -> bool {
        self.major == requested.major && self.minor >= requested.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(label) = &self.label {
            write!(f, "-{label}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = GatewayError;

    /// Parse `[v]major[.minor[.patch]][-label]`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix('v').unwrap_or(s);

        let (numbers, label) = match s.split_once('-') {
            Some((head, tail)) if !tail.is_empty() => (head, Some(tail.to_string())),
            Some((head, _)) => (head, None),
            None => (s, None),
        };

        let mut parts = numbers.split('.');
        let major = parse_component(parts.next(), "major", s)?;
        let minor = match parts.next() {
            Some(p) => parse_component(Some(p), "minor", s)?,
            None => 0,
        };
        let patch = match parts.next() {
            Some(p) => parse_component(Some(p), "patch", s)?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(GatewayError::InvalidArg(format!("invalid version format: {s}")));
        }

        Ok(Self { major, minor, patch, label })
    }
}

fn parse_component(part: Option<&str>, name: &str, full: &str) -> Result<u64> {
    let part = part.filter(|p| !p.is_empty()).ok_or_else(|| {
        GatewayError::InvalidArg(format!("invalid version format: {full}"))
    })?;
    part.parse::<u64>().map_err(|_| {
        GatewayError::InvalidArg(format!("invalid {name} version component in '{full}'"))
    })
}
