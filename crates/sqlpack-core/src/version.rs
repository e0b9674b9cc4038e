//! Module version constraints
//!
//! Versions are semantic versions. A constraint written as a bare version
//! (`1.2.0`) is an exact pin, `*` / `latest` accepts anything, and every other
//! form is a semver requirement (`^1.1`, `>=1.0, <2.0`).

use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A version constraint as written in a module manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// Any version; the newest available wins
    Any,

    /// Exactly this version
    Exact(Version),

    /// A semver requirement
    Req(VersionReq),
}

impl VersionConstraint {
    /// Parse a manifest constraint string
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::Any);
        }

        let unprefixed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if let Ok(version) = Version::parse(unprefixed) {
            return Ok(Self::Exact(version));
        }

        VersionReq::parse(trimmed)
            .map(Self::Req)
            .map_err(|e| VersionError::InvalidConstraint(raw.to_string(), e.to_string()))
    }

    /// Check whether a concrete version satisfies this constraint
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(pinned) => pinned == version,
            Self::Req(req) => req.matches(version),
        }
    }

    /// Highest version in `available` that satisfies the constraint
    pub fn select_highest<'a, I>(&self, available: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        available.into_iter().filter(|v| self.matches(v)).max()
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Exact(version) => write!(f, "{}", version),
            Self::Req(req) => write!(f, "{}", req),
        }
    }
}

impl std::str::FromStr for VersionConstraint {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse a concrete module version, tolerating a leading `v`
pub fn parse_version(raw: &str) -> Result<Version, VersionError> {
    let trimmed = raw.trim();
    let unprefixed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(unprefixed)
        .map_err(|e| VersionError::InvalidVersion(raw.to_string(), e.to_string()))
}

/// Version parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid version '{0}': {1}")]
    InvalidVersion(String, String),

    #[error("invalid version constraint '{0}': {1}")]
    InvalidConstraint(String, String),
}
