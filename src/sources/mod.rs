// src/sources/mod.rs

//! Manifest sources and the merged source overlay
//!
//! This module provides:
//! - The concrete source kinds (built-in, local directory, remote, in-memory)
//!   behind one capability: produce the current manifest set, and sync
//! - The ordered `SourceSet` overlay with name shadowing and TTL-gated sync
//! - The merged, immutable `Overlay` snapshot the resolver works against
//!
//! A sync replaces a source's manifest set atomically: the new set is built
//! completely before it is published, so a reader holding a snapshot sees
//! either the old or the new set, never a mix.

use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestIndex};
use reqwest::blocking::Client;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default staleness TTL for remote sources (24 hours)
pub const DEFAULT_SYNC_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum retry attempts for failed index fetches
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Name of the manifest index document served by remote sources
const INDEX_FILENAME: &str = "index.json";

/// Configuration for opening a source set
#[derive(Debug, Clone)]
pub struct Config {
    /// Ordered source locators; later entries shadow earlier ones
    pub sources: Vec<SourceLocator>,
    /// Staleness TTL applied to remote sources
    pub sync_ttl: Duration,
    /// Per-request network timeout
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            sync_ttl: DEFAULT_SYNC_TTL,
            http_timeout: HTTP_TIMEOUT,
        }
    }
}

/// Where a configured source comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// A directory of per-package manifest JSON files
    LocalPath(PathBuf),
    /// A remote repository URL serving an index document
    RemoteUrl(String),
}

/// HTTP client wrapper with retry support
pub struct HttpClient {
    client: Client,
    max_retries: u32,
}

impl HttpClient {
    /// Create a new client with the given per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Fetch a remote manifest index with retry support
    pub fn fetch_index(&self, url: &str) -> Result<ManifestIndex> {
        let index_url = if url.ends_with('/') {
            format!("{}{}", url, INDEX_FILENAME)
        } else {
            format!("{}/{}", url, INDEX_FILENAME)
        };

        debug!("Fetching manifest index from {}", index_url);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(&index_url).send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::Download(format!(
                            "HTTP {} from {}",
                            response.status(),
                            index_url
                        )));
                    }

                    let index: ManifestIndex = response.json().map_err(|e| {
                        Error::Download(format!("Failed to parse manifest index JSON: {}", e))
                    })?;

                    debug!(
                        "Fetched index '{}' with {} manifests",
                        index.name,
                        index.manifests.len()
                    );
                    return Ok(index);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::Download(format!(
                            "Failed to fetch index after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Index fetch attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    /// Download a file to the specified path with retry support.
    ///
    /// The body is written to a temporary sibling first and atomically
    /// renamed into place, so a crash never leaves a torn destination.
    pub fn download_file(&self, url: &str, dest_path: &Path) -> Result<()> {
        debug!("Downloading {} to {}", url, dest_path.display());

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::Download(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    let temp_path = dest_path.with_extension("tmp");
                    let mut file = fs::File::create(&temp_path)?;
                    std::io::copy(&mut response, &mut file)
                        .map_err(|e| Error::Download(format!("Failed to write body: {}", e)))?;
                    fs::rename(&temp_path, dest_path)?;

                    debug!("Downloaded to {}", dest_path.display());
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::Download(format!(
                            "Failed to download after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

/// Concrete source kinds behind the single sync capability
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Manifests compiled into the tool; never stale
    Builtin,
    /// A directory of `<package>.json` manifest files; re-scanned on sync
    LocalDir(PathBuf),
    /// A remote repository serving an index document; TTL-gated sync
    Remote(String),
    /// Manifests supplied directly in memory; never stale
    Memory,
}

/// A named, ordered provider of manifests
pub struct Source {
    name: String,
    kind: SourceKind,
    ttl: Duration,
    last_sync: Option<Instant>,
    /// Published manifest set, replaced wholesale on sync
    manifests: Arc<BTreeMap<String, Manifest>>,
}

impl Source {
    /// A built-in source with a fixed manifest set
    pub fn builtin(name: impl Into<String>, manifests: Vec<Manifest>) -> Result<Self> {
        Self::fixed(name.into(), SourceKind::Builtin, manifests)
    }

    /// An in-memory source, primarily for tests and embedding
    pub fn memory(name: impl Into<String>, manifests: Vec<Manifest>) -> Result<Self> {
        Self::fixed(name.into(), SourceKind::Memory, manifests)
    }

    fn fixed(name: String, kind: SourceKind, manifests: Vec<Manifest>) -> Result<Self> {
        let set = build_manifest_set(manifests)?;
        Ok(Self {
            name,
            kind,
            ttl: Duration::ZERO,
            last_sync: None,
            manifests: Arc::new(set),
        })
    }

    /// A local directory source; each `*.json` file holds one manifest
    pub fn local_dir(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::LocalDir(path.into()),
            ttl: Duration::ZERO,
            last_sync: None,
            manifests: Arc::new(BTreeMap::new()),
        }
    }

    /// A remote source with a staleness TTL
    pub fn remote(name: impl Into<String>, url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::Remote(url.into()),
            ttl,
            last_sync: None,
            manifests: Arc::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// Whether a non-forced sync should re-fetch this source.
    ///
    /// Built-in and in-memory sources are never stale. Local directories
    /// are re-scanned on every sync; they carry no TTL because no network
    /// is involved.
    pub fn is_stale(&self) -> bool {
        match self.kind {
            SourceKind::Builtin | SourceKind::Memory => false,
            SourceKind::LocalDir(_) => true,
            SourceKind::Remote(_) => match self.last_sync {
                None => true,
                Some(at) => at.elapsed() > self.ttl,
            },
        }
    }

    /// Current published manifest set (cheap Arc clone)
    pub fn manifests(&self) -> Arc<BTreeMap<String, Manifest>> {
        Arc::clone(&self.manifests)
    }

    /// Re-fetch this source's manifests and publish them atomically.
    ///
    /// For built-in and in-memory sources this is a no-op. The new set is
    /// built completely before the published `Arc` is swapped.
    fn sync(&mut self, client: &HttpClient, force: bool) -> Result<()> {
        match &self.kind {
            SourceKind::Builtin | SourceKind::Memory => Ok(()),
            SourceKind::LocalDir(path) => {
                let manifests = load_manifest_dir(path).map_err(|e| Error::SourceUnavailable {
                    source_name: self.name.clone(),
                    reason: e.to_string(),
                })?;
                let count = manifests.len();
                self.manifests = Arc::new(manifests);
                self.last_sync = Some(Instant::now());
                debug!("Source '{}': scanned {} manifests", self.name, count);
                Ok(())
            }
            SourceKind::Remote(url) => {
                if !force && !self.is_stale() {
                    debug!("Source '{}' is fresh, skipping sync", self.name);
                    return Ok(());
                }
                let index = client
                    .fetch_index(url)
                    .map_err(|e| Error::SourceUnavailable {
                        source_name: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                let set =
                    build_manifest_set(index.manifests).map_err(|e| Error::SourceUnavailable {
                        source_name: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                let count = set.len();
                self.manifests = Arc::new(set);
                self.last_sync = Some(Instant::now());
                info!("Source '{}': synced {} manifests", self.name, count);
                Ok(())
            }
        }
    }
}

/// Validate a manifest list and key it by package name
fn build_manifest_set(manifests: Vec<Manifest>) -> Result<BTreeMap<String, Manifest>> {
    let mut set = BTreeMap::new();
    for manifest in manifests {
        manifest.validate()?;
        set.insert(manifest.name.clone(), manifest);
    }
    Ok(set)
}

/// Load every `*.json` manifest from a directory
fn load_manifest_dir(path: &Path) -> Result<BTreeMap<String, Manifest>> {
    let mut manifests = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_path = entry.path();
        if file_path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let data = fs::read_to_string(&file_path)?;
        let manifest: Manifest =
            serde_json::from_str(&data).map_err(|e| Error::InvalidManifest {
                name: file_path.display().to_string(),
                reason: e.to_string(),
            })?;
        manifests.push(manifest);
    }
    build_manifest_set(manifests)
}

/// Outcome of a `SourceSet::sync` pass.
///
/// Sync aggregates per-source failures instead of aborting: sources that
/// fail keep their previously published set and are reported here.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Names of sources that re-fetched their manifest set
    pub synced: Vec<String>,
    /// Names of sources skipped because they were fresh (TTL not elapsed)
    pub skipped: Vec<String>,
    /// Per-source failures (`Error::SourceUnavailable`)
    pub failures: Vec<Error>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// An ordered overlay of manifest sources.
///
/// Sources are kept in insertion order; adding a source whose name collides
/// with an existing one replaces it at the later (higher) precedence.
pub struct SourceSet {
    sources: Vec<Source>,
    client: HttpClient,
}

impl SourceSet {
    /// Create an empty source set with its own HTTP client
    pub fn new(http_timeout: Duration) -> Result<Self> {
        Ok(Self {
            sources: Vec::new(),
            client: HttpClient::new(http_timeout)?,
        })
    }

    /// Build a source set from configuration: the built-in source first,
    /// then each configured locator in order.
    pub fn from_config(config: &Config, builtin: Source) -> Result<Self> {
        let mut set = Self::new(config.http_timeout)?;
        set.add_source(builtin);
        for locator in &config.sources {
            match locator {
                SourceLocator::LocalPath(path) => {
                    let name = path.display().to_string();
                    set.add_source(Source::local_dir(name, path.clone()));
                }
                SourceLocator::RemoteUrl(url) => {
                    set.add_source(Source::remote(url.clone(), url.clone(), config.sync_ttl));
                }
            }
        }
        Ok(set)
    }

    /// Add a source. Idempotent: re-adding a name removes the earlier entry
    /// and the new source takes the later precedence slot.
    pub fn add_source(&mut self, source: Source) {
        if let Some(pos) = self.sources.iter().position(|s| s.name == source.name) {
            debug!("Source '{}' re-added, shadowing earlier entry", source.name);
            self.sources.remove(pos);
        }
        self.sources.push(source);
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Sync every source that is forced or stale.
    ///
    /// A failing source keeps its previous manifest set and contributes a
    /// `SourceUnavailable` entry to the report; the other sources still
    /// update. The call itself never aborts on a per-source failure.
    pub fn sync(&mut self, force: bool) -> SyncReport {
        let mut report = SyncReport::default();
        for source in &mut self.sources {
            if !force && !source.is_stale() {
                report.skipped.push(source.name.clone());
                continue;
            }
            match source.sync(&self.client, force) {
                Ok(()) => report.synced.push(source.name.clone()),
                Err(e) => {
                    warn!("Sync failed for source '{}': {}", source.name, e);
                    report.failures.push(e);
                }
            }
        }
        report
    }

    /// Merged, immutable view of all sources in precedence order.
    ///
    /// Manifests for the same package are merged field-wise: colliding
    /// version entries and channel labels are overridden by later-added
    /// sources; non-colliding entries are unioned.
    pub fn snapshot(&self) -> Overlay {
        let mut merged: BTreeMap<String, Manifest> = BTreeMap::new();
        for source in &self.sources {
            for (name, manifest) in source.manifests().iter() {
                match merged.get_mut(name) {
                    None => {
                        merged.insert(name.clone(), manifest.clone());
                    }
                    Some(existing) => merge_manifest(existing, manifest),
                }
            }
        }
        Overlay {
            merged: Arc::new(merged),
        }
    }

    /// Reference to the shared HTTP client (used for artifact downloads)
    pub fn http_client(&self) -> &HttpClient {
        &self.client
    }
}

/// Merge `later` into `earlier`, later source winning on collisions
fn merge_manifest(earlier: &mut Manifest, later: &Manifest) {
    for (version, builds) in &later.versions {
        earlier
            .versions
            .insert(version.clone(), builds.clone());
    }
    for (channel, target) in &later.channels {
        earlier.channels.insert(channel.clone(), target.clone());
    }
    if later.default_channel.is_some() {
        earlier.default_channel = later.default_channel.clone();
    }
    if later.description.is_some() {
        earlier.description = later.description.clone();
    }
    for (key, value) in &later.env {
        earlier.env.insert(key.clone(), value.clone());
    }
    for dep in &later.requires {
        if !earlier.requires.contains(dep) {
            earlier.requires.push(dep.clone());
        }
    }
}

/// Immutable merged manifest view for one resolution pass
#[derive(Clone)]
pub struct Overlay {
    merged: Arc<BTreeMap<String, Manifest>>,
}

impl Overlay {
    pub fn get(&self, name: &str) -> Option<&Manifest> {
        self.merged.get(name)
    }

    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.merged.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }
}
