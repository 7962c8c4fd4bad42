// src/manifest.rs

//! Package manifests and reference parsing
//!
//! A manifest describes one package: its available versions, the per-platform
//! builds (download URL + sha256 digest) for each version, and the named
//! channels that float across versions. Manifests are plain JSON and are
//! immutable once loaded for a resolution pass; the source that produced a
//! manifest owns it.

use crate::error::{Error, Result};
use crate::platform::Platform;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One downloadable build of a package version for a specific platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    /// Download URL for the artifact (a gzip tarball)
    pub url: String,
    /// Hex-encoded sha256 digest of the artifact; also the cache key
    pub digest: String,
    /// Artifact size in bytes, if the source declares it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

/// Declarative description of one package's available versions and channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// version string -> platform -> build
    #[serde(default)]
    pub versions: BTreeMap<String, BTreeMap<Platform, Build>>,
    /// channel label -> version string, re-resolved on each sync
    #[serde(default)]
    pub channels: BTreeMap<String, String>,
    /// Channel used when a bare `name` reference is resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<String>,
    /// Environment variables the package contributes when activated
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Names of packages this one depends on
    #[serde(default)]
    pub requires: Vec<String>,
}

impl Manifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            versions: BTreeMap::new(),
            channels: BTreeMap::new(),
            default_channel: None,
            env: BTreeMap::new(),
            requires: Vec::new(),
        }
    }

    /// Validate structural invariants after loading.
    ///
    /// Every version key must parse as semver so that range selection and
    /// channel monotonicity have a total order. Channel pointers may dangle
    /// at load time (a later-merged source can supply the version); the
    /// resolver reports those as `VersionNotFound`.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('@') {
            return Err(Error::InvalidManifest {
                name: self.name.clone(),
                reason: "package name must be non-empty and must not contain '@'".to_string(),
            });
        }
        for version in self.versions.keys() {
            Version::parse(version).map_err(|e| Error::InvalidManifest {
                name: self.name.clone(),
                reason: format!("version '{}' is not valid semver: {}", version, e),
            })?;
        }
        for (channel, target) in &self.channels {
            Version::parse(target).map_err(|e| Error::InvalidManifest {
                name: self.name.clone(),
                reason: format!(
                    "channel '{}' points at invalid version '{}': {}",
                    channel, target, e
                ),
            })?;
        }
        if let Some(channel) = &self.default_channel {
            if !self.channels.contains_key(channel) {
                return Err(Error::InvalidManifest {
                    name: self.name.clone(),
                    reason: format!("default channel '{}' is not declared", channel),
                });
            }
        }
        Ok(())
    }
}

/// Manifest index format served by remote sources (simple JSON document)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestIndex {
    pub name: String,
    pub manifests: Vec<Manifest>,
}

/// Resolution mode of a package reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// A literal version that must exist in the manifest
    Exact(String),
    /// A named channel whose pointer is followed at resolution time
    Channel(String),
    /// A semver constraint; the highest satisfying version wins
    Range(VersionReq),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Exact(v) => write!(f, "{}", v),
            Selector::Channel(c) => write!(f, "{}", c),
            Selector::Range(r) => write!(f, "{}", r),
        }
    }
}

/// A parsed `name@selector` reference; a bare `name` leaves the selector
/// empty, meaning "the manifest's default".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReference {
    pub name: String,
    pub selector: Option<Selector>,
}

impl PackageReference {
    pub fn new(name: impl Into<String>, selector: Option<Selector>) -> Self {
        Self {
            name: name.into(),
            selector,
        }
    }

    /// Parse a reference string.
    ///
    /// Selector classification: a selector starting with a digit is treated
    /// as a version (Exact if it parses as a full semver version, Range
    /// otherwise, e.g. `1.2` or `1.x`); a selector containing constraint
    /// operators (`^ ~ > < = *`) is a Range; anything else is a channel label.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let (name, selector) = match reference.split_once('@') {
            None => (reference, None),
            Some((name, selector)) => (name, Some(selector)),
        };

        if name.is_empty() {
            return Err(invalid("package name is empty"));
        }
        if name.contains('@') || name.contains('/') {
            return Err(invalid("package name contains reserved characters"));
        }

        let selector = match selector {
            None => None,
            Some("") => return Err(invalid("selector after '@' is empty")),
            Some(s) => Some(Self::classify_selector(reference, s)?),
        };

        Ok(Self {
            name: name.to_string(),
            selector,
        })
    }

    fn classify_selector(reference: &str, s: &str) -> Result<Selector> {
        let has_operator = s.contains(['^', '~', '>', '<', '=', '*', ',']);
        let version_like = s.starts_with(|c: char| c.is_ascii_digit());

        if version_like && !has_operator {
            if Version::parse(s).is_ok() {
                return Ok(Selector::Exact(s.to_string()));
            }
            // Partial versions like "1.2" or "1.x" act as ranges
            let req = VersionReq::parse(s).map_err(|e| Error::InvalidReference {
                reference: reference.to_string(),
                reason: format!("invalid version selector '{}': {}", s, e),
            })?;
            return Ok(Selector::Range(req));
        }

        if has_operator {
            let req = VersionReq::parse(s).map_err(|e| Error::InvalidReference {
                reference: reference.to_string(),
                reason: format!("invalid range selector '{}': {}", s, e),
            })?;
            return Ok(Selector::Range(req));
        }

        Ok(Selector::Channel(s.to_string()))
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            None => write!(f, "{}", self.name),
            Some(sel) => write!(f, "{}@{}", self.name, sel),
        }
    }
}

impl FromStr for PackageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
