// src/resolver.rs

//! Package reference resolution
//!
//! Resolution is a pure function over (reference, merged overlay, platform):
//! it has no side effects and returns identical results for identical
//! inputs. Platform filtering happens before version selection, so a
//! name/version that matched but has no build for the current platform is
//! reported as `UnsupportedPlatform`, not `VersionNotFound`.

use crate::error::{Error, Result};
use crate::manifest::{Manifest, PackageReference, Selector};
use crate::platform::Platform;
use crate::sources::Overlay;
use semver::Version;
use std::collections::BTreeMap;
use tracing::debug;

/// A concrete, immutable resolution result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: Version,
    pub platform: Platform,
    /// Hex-encoded sha256 of the artifact; the cache key
    pub digest: String,
    /// Download URL of the artifact
    pub url: String,
    /// Set when the reference was channel-bound (explicitly or via the
    /// manifest's default channel)
    pub channel: Option<String>,
    /// Environment variables the package contributes when activated
    pub env: BTreeMap<String, String>,
    /// Names of packages this one depends on
    pub requires: Vec<String>,
}

impl ResolvedPackage {
    /// The reference this resolution came from, e.g. `go@stable` or `go@1.21.3`
    pub fn reference(&self) -> String {
        match &self.channel {
            Some(channel) => format!("{}@{}", self.name, channel),
            None => format!("{}@{}", self.name, self.version),
        }
    }
}

/// Resolve a package reference against a merged overlay snapshot.
pub fn resolve(
    overlay: &Overlay,
    reference: &PackageReference,
    platform: &Platform,
) -> Result<ResolvedPackage> {
    let manifest = overlay
        .get(&reference.name)
        .ok_or_else(|| Error::UnknownPackage(reference.name.clone()))?;

    let (version, channel) = match &reference.selector {
        Some(Selector::Exact(version)) => {
            if !manifest.versions.contains_key(version) {
                return Err(Error::VersionNotFound {
                    name: reference.name.clone(),
                    selector: version.clone(),
                });
            }
            (version.clone(), None)
        }
        Some(Selector::Channel(label)) => (follow_channel(manifest, label)?, Some(label.clone())),
        Some(Selector::Range(req)) => {
            let version = select_range(manifest, platform, reference, &req.to_string(), |v| {
                req.matches(v)
            })?;
            (version, None)
        }
        None => match &manifest.default_channel {
            Some(label) => (follow_channel(manifest, label)?, Some(label.clone())),
            // No default channel: highest version available for this platform
            None => {
                let version = select_range(manifest, platform, reference, "latest", |_| true)?;
                (version, None)
            }
        },
    };

    let builds = manifest.versions.get(&version).ok_or_else(|| {
        // Channel pointer dangles: the label exists but its target does not
        Error::VersionNotFound {
            name: reference.name.clone(),
            selector: version.clone(),
        }
    })?;

    let build = builds
        .get(platform)
        .ok_or_else(|| Error::UnsupportedPlatform {
            name: reference.name.clone(),
            version: version.clone(),
            platform: platform.to_string(),
        })?;

    // Version keys are validated as semver at manifest load
    let version = Version::parse(&version).map_err(|e| Error::InvalidManifest {
        name: reference.name.clone(),
        reason: format!("unparseable version '{}': {}", version, e),
    })?;

    debug!("Resolved {} to {}-{}", reference, reference.name, version);

    Ok(ResolvedPackage {
        name: reference.name.clone(),
        version,
        platform: platform.clone(),
        digest: build.digest.clone(),
        url: build.url.clone(),
        channel,
        env: manifest.env.clone(),
        requires: manifest.requires.clone(),
    })
}

/// Follow a channel label to its current version pointer
fn follow_channel(manifest: &Manifest, label: &str) -> Result<String> {
    manifest
        .channels
        .get(label)
        .cloned()
        .ok_or_else(|| Error::VersionNotFound {
            name: manifest.name.clone(),
            selector: label.to_string(),
        })
}

/// Pick the highest version accepted by `matches`, considering only
/// versions that carry a build for the requested platform.
///
/// Distinguishes "nothing satisfied the constraint" (`VersionNotFound`)
/// from "versions matched but none support this platform"
/// (`UnsupportedPlatform`).
fn select_range(
    manifest: &Manifest,
    platform: &Platform,
    reference: &PackageReference,
    selector_repr: &str,
    matches: impl Fn(&Version) -> bool,
) -> Result<String> {
    let mut best: Option<(Version, &String)> = None;
    let mut constraint_matched = false;
    let mut best_unsupported: Option<Version> = None;

    for (version_str, builds) in &manifest.versions {
        let Ok(version) = Version::parse(version_str) else {
            continue;
        };
        if !matches(&version) {
            continue;
        }
        constraint_matched = true;
        if !builds.contains_key(platform) {
            if best_unsupported.as_ref().is_none_or(|b| version > *b) {
                best_unsupported = Some(version);
            }
            continue;
        }
        if best.as_ref().is_none_or(|(b, _)| version > *b) {
            best = Some((version, version_str));
        }
    }

    match best {
        Some((_, version_str)) => Ok(version_str.clone()),
        None if constraint_matched => Err(Error::UnsupportedPlatform {
            name: reference.name.clone(),
            version: best_unsupported
                .map(|v| v.to_string())
                .unwrap_or_default(),
            platform: platform.to_string(),
        }),
        None => Err(Error::VersionNotFound {
            name: reference.name.clone(),
            selector: selector_repr.to_string(),
        }),
    }
}
