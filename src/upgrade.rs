// src/upgrade.rs

//! Channel upgrade protocol and self-upgrade helpers
//!
//! `upgrade_channel` composes the resolver, cache, and state store to
//! advance a channel-pinned installation: re-resolve against a freshly
//! synced overlay, fetch the new artifact if the channel moved forward,
//! swap the active installation link atomically, and record the new
//! version. The prior artifact stays in the cache for rollback.
//!
//! A channel record's version only ever moves forward: if a synced channel
//! points at or below the recorded version, the call is a no-op.
//!
//! The tool's own self-update rides the same path. Its identity is
//! recovered from the installation directory's `<name>@<channel>` naming
//! convention, computed once at startup and passed in explicitly; the
//! running executable is replaced via write-to-temp then atomic rename,
//! and exit/re-exec is left to the caller.

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::manifest::{PackageReference, Selector};
use crate::platform::Platform;
use crate::resolver::{self, ResolvedPackage};
use crate::sources::SourceSet;
use crate::state::StateStore;
use crate::state::models::InstalledPackage;
use semver::Version;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of an upgrade attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The channel moved forward and the installation was advanced
    Upgraded { from: Version, to: Version },
    /// The channel still points at (or below) the recorded version
    UpToDate,
    /// The record is pinned to an exact version and does not track a channel
    Pinned,
}

/// Advance a channel-pinned installation to the channel's current version.
///
/// Syncs the overlay (forced), re-resolves the record's channel reference,
/// and upgrades only if the resolved version strictly exceeds the recorded
/// one. Sync failures on individual sources are warnings; resolution then
/// proceeds on the remaining sources' data.
pub fn upgrade_channel(
    sources: &mut SourceSet,
    cache: &Cache,
    state: &mut StateStore,
    active_root: &Path,
    record: &InstalledPackage,
    platform: &Platform,
    deadline: Duration,
) -> Result<UpgradeOutcome> {
    let Some(channel) = &record.channel else {
        debug!("{} is version-pinned, skipping upgrade", record.name);
        return Ok(UpgradeOutcome::Pinned);
    };

    let report = sources.sync(true);
    for failure in &report.failures {
        warn!("Upgrade sync warning: {}", failure);
    }

    let reference = PackageReference::new(
        record.name.clone(),
        Some(Selector::Channel(channel.clone())),
    );
    let resolved = resolver::resolve(&sources.snapshot(), &reference, platform)?;

    let current = Version::parse(&record.version).map_err(|e| Error::StateCorruption(format!(
        "recorded version '{}' for {} is not valid semver: {}",
        record.version, record.name, e
    )))?;

    state.touch_upgrade_check(&record.environment, &record.name)?;

    if resolved.version == current {
        debug!("{} is up to date at {}", reference, current);
        return Ok(UpgradeOutcome::UpToDate);
    }
    if resolved.version < current {
        // Channel regressed upstream; never downgrade silently
        warn!(
            "Channel {} points at {} but {} is installed; refusing downgrade",
            reference, resolved.version, current
        );
        return Ok(UpgradeOutcome::UpToDate);
    }

    let artifact_dir = cache.fetch_resolved(&resolved, sources.http_client(), deadline)?;
    activate(active_root, &resolved.reference(), &artifact_dir)?;
    state.record(&record.environment, &resolved, Some(channel.as_str()))?;

    info!("Upgraded {} from {} to {}", reference, current, resolved.version);
    Ok(UpgradeOutcome::Upgraded {
        from: current,
        to: resolved.version,
    })
}

/// Link name a resolved package occupies under the active root:
/// `<name>@<channel>` for channel installs, `<name>-<version>` otherwise.
pub fn active_link_name(resolved: &ResolvedPackage) -> String {
    match &resolved.channel {
        Some(channel) => format!("{}@{}", resolved.name, channel),
        None => format!("{}-{}", resolved.name, resolved.version),
    }
}

/// Point the active installation link at a cached artifact directory.
///
/// The swap is atomic: a new symlink is created at a temporary path and
/// renamed over the old one, so readers always see a complete installation.
pub fn activate(active_root: &Path, link_name: &str, artifact_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(active_root)?;
    let link = active_root.join(link_name);
    let staged = active_root.join(format!(".{}.tmp-{}", link_name, std::process::id()));

    let _ = fs::remove_file(&staged);
    symlink_dir(artifact_dir, &staged)?;
    if let Err(e) = fs::rename(&staged, &link) {
        let _ = fs::remove_file(&staged);
        return Err(e.into());
    }

    debug!("Activated {} -> {}", link.display(), artifact_dir.display());
    Ok(link)
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Recover the tool's own package reference from its installation path.
///
/// The executable's parent directory is expected to be named
/// `<name>@<channel>`; anything else means the tool was not installed
/// through a channel and self-upgrade does not apply. This is the one
/// place the core inspects its own runtime location.
pub fn self_reference(exe_path: &Path) -> Option<PackageReference> {
    let dir_name = exe_path.parent()?.file_name()?.to_str()?;
    if !dir_name.contains('@') {
        return None;
    }
    match PackageReference::parse(dir_name) {
        Ok(reference) if matches!(reference.selector, Some(Selector::Channel(_))) => {
            Some(reference)
        }
        _ => None,
    }
}

/// Upgrade the running tool itself if its channel has moved past
/// `current_version`.
///
/// The new binary is written next to the current one and atomically renamed
/// over it; a file that is currently mapped for execution is never
/// overwritten in place. Exiting or re-executing is deferred to the caller.
pub fn self_upgrade(
    sources: &mut SourceSet,
    cache: &Cache,
    reference: &PackageReference,
    current_version: &Version,
    exe_path: &Path,
    platform: &Platform,
    deadline: Duration,
) -> Result<UpgradeOutcome> {
    let Some(Selector::Channel(_)) = &reference.selector else {
        return Ok(UpgradeOutcome::Pinned);
    };

    let report = sources.sync(true);
    for failure in &report.failures {
        warn!("Self-upgrade sync warning: {}", failure);
    }

    let resolved = resolver::resolve(&sources.snapshot(), reference, platform)?;
    if resolved.version <= *current_version {
        debug!("{} is up to date at {}", reference, current_version);
        return Ok(UpgradeOutcome::UpToDate);
    }

    let artifact_dir = cache.fetch_resolved(&resolved, sources.http_client(), deadline)?;
    let new_binary = artifact_dir.join(&reference.name);
    if !new_binary.is_file() {
        return Err(Error::InvalidManifest {
            name: reference.name.clone(),
            reason: format!(
                "self-upgrade artifact does not contain a '{}' binary",
                reference.name
            ),
        });
    }

    replace_executable(exe_path, &new_binary)?;
    info!(
        "Self-upgraded {} from {} to {}",
        reference, current_version, resolved.version
    );
    Ok(UpgradeOutcome::Upgraded {
        from: current_version.clone(),
        to: resolved.version,
    })
}

/// Replace `current` with `new` via write-to-temp then atomic rename.
///
/// The temporary copy lands in the same directory as `current` so the
/// final rename cannot cross filesystems.
pub fn replace_executable(current: &Path, new: &Path) -> Result<()> {
    let dir = current.parent().ok_or_else(|| {
        Error::InitError(format!(
            "executable path {} has no parent directory",
            current.display()
        ))
    })?;

    let staged = dir.join(format!(
        ".{}.new-{}",
        current
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("binary"),
        std::process::id()
    ));

    if let Err(e) = fs::copy(new, &staged) {
        let _ = fs::remove_file(&staged);
        return Err(e.into());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&staged, fs::Permissions::from_mode(0o755))?;
    }

    if let Err(e) = fs::rename(&staged, current) {
        let _ = fs::remove_file(&staged);
        return Err(e.into());
    }

    debug!("Replaced executable {}", current.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Build, Manifest};
    use crate::sources::Source;
    use std::collections::BTreeMap;

    fn linux() -> Platform {
        Platform::new("linux", "amd64")
    }

    fn channel_manifest(name: &str, versions: &[&str], channel: (&str, &str)) -> Manifest {
        let mut m = Manifest::new(name);
        for v in versions {
            let mut builds = BTreeMap::new();
            builds.insert(
                linux(),
                Build {
                    url: format!("https://example.com/{}-{}.tar.gz", name, v),
                    digest: "aa".repeat(32),
                    size: None,
                },
            );
            m.versions.insert(v.to_string(), builds);
        }
        m.channels
            .insert(channel.0.to_string(), channel.1.to_string());
        m
    }

    fn fixture(manifests: Vec<Manifest>) -> (tempfile::TempDir, SourceSet, Cache, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let mut sources = SourceSet::new(Duration::from_secs(5)).unwrap();
        sources.add_source(Source::memory("test", manifests).unwrap());
        let cache = Cache::open(dir.path().join("cache")).unwrap();
        let state = StateStore::open(&dir.path().join("state")).unwrap();
        (dir, sources, cache, state)
    }

    fn installed(name: &str, version: &str, channel: Option<&str>) -> InstalledPackage {
        InstalledPackage::new(
            "default".to_string(),
            name.to_string(),
            version.to_string(),
            channel.map(|c| c.to_string()),
            "aa".repeat(32),
            "linux-amd64".to_string(),
        )
    }

    #[test]
    fn test_pinned_record_is_not_upgraded() {
        let (dir, mut sources, cache, mut state) =
            fixture(vec![channel_manifest("go", &["1.21.3"], ("stable", "1.21.3"))]);

        let outcome = upgrade_channel(
            &mut sources,
            &cache,
            &mut state,
            &dir.path().join("active"),
            &installed("go", "1.21.3", None),
            &linux(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(outcome, UpgradeOutcome::Pinned);
    }

    #[test]
    fn test_unchanged_channel_is_up_to_date() {
        let (dir, mut sources, cache, mut state) =
            fixture(vec![channel_manifest("go", &["1.21.3"], ("stable", "1.21.3"))]);
        let record = installed("go", "1.21.3", Some("stable"));
        state
            .record(
                "default",
                &ResolvedPackage {
                    name: "go".to_string(),
                    version: Version::parse("1.21.3").unwrap(),
                    platform: linux(),
                    digest: "aa".repeat(32),
                    url: "https://example.com/go-1.21.3.tar.gz".to_string(),
                    channel: Some("stable".to_string()),
                    env: BTreeMap::new(),
                    requires: Vec::new(),
                },
                Some("stable"),
            )
            .unwrap();

        let outcome = upgrade_channel(
            &mut sources,
            &cache,
            &mut state,
            &dir.path().join("active"),
            &record,
            &linux(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(outcome, UpgradeOutcome::UpToDate);

        // The check ran, and the record is untouched
        let after = state.get("default", "go").unwrap().unwrap();
        assert_eq!(after.version, "1.21.3");
        assert!(after.last_upgrade_check.is_some());
    }

    #[test]
    fn test_channel_regression_never_downgrades() {
        // Channel points below the installed version; no fetch happens and
        // the record keeps its version
        let (dir, mut sources, cache, mut state) =
            fixture(vec![channel_manifest("go", &["1.20.0"], ("stable", "1.20.0"))]);

        let outcome = upgrade_channel(
            &mut sources,
            &cache,
            &mut state,
            &dir.path().join("active"),
            &installed("go", "1.21.3", Some("stable")),
            &linux(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(outcome, UpgradeOutcome::UpToDate);
    }

    #[test]
    fn test_self_reference_from_install_path() {
        let reference =
            self_reference(Path::new("/home/u/.burrow/active/burrow@stable/burrow")).unwrap();
        assert_eq!(reference.name, "burrow");
        assert_eq!(
            reference.selector,
            Some(Selector::Channel("stable".to_string()))
        );
    }

    #[test]
    fn test_self_reference_rejects_plain_directories() {
        assert!(self_reference(Path::new("/usr/local/bin/burrow")).is_none());
        // Version-pinned install dirs are not channel-bound
        assert!(self_reference(Path::new("/x/burrow@1.2.3/burrow")).is_none());
    }

    #[test]
    fn test_activate_swaps_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("active");
        let old_artifact = dir.path().join("old");
        let new_artifact = dir.path().join("new");
        fs::create_dir_all(&old_artifact).unwrap();
        fs::create_dir_all(&new_artifact).unwrap();
        fs::write(old_artifact.join("marker"), "old").unwrap();
        fs::write(new_artifact.join("marker"), "new").unwrap();

        let link = activate(&active, "tool@stable", &old_artifact).unwrap();
        assert_eq!(fs::read_to_string(link.join("marker")).unwrap(), "old");

        let link = activate(&active, "tool@stable", &new_artifact).unwrap();
        assert_eq!(fs::read_to_string(link.join("marker")).unwrap(), "new");

        // No staging leftovers
        let entries: Vec<_> = fs::read_dir(&active)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_replace_executable_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("tool");
        let new = dir.path().join("tool-next");
        fs::write(&current, "old-binary").unwrap();
        fs::write(&new, "new-binary").unwrap();

        replace_executable(&current, &new).unwrap();

        assert_eq!(fs::read_to_string(&current).unwrap(), "new-binary");
        // Source copy is untouched, staging is cleaned up
        assert_eq!(fs::read_to_string(&new).unwrap(), "new-binary");
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!names.iter().any(|n| n.contains(".new-")));
    }
}
