//! Collaborator interfaces the engine consumes, plus in-process
//! implementations for embedding and tests.

use crate::config::EngineConfig;
use crate::error::{TransferError, TransferResult};
use crate::session::{ChunkReader, ChunkWriter};
use crate::types::{AuthMaterial, Endpoint};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

// ── Credentials ──────────────────────────────────────────────────────

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, site_id: &str) -> TransferResult<(Endpoint, AuthMaterial)>;
}

/// Fixed site table.
#[derive(Default)]
pub struct StaticCredentials {
    sites: RwLock<HashMap<String, (Endpoint, AuthMaterial)>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(self, site_id: impl Into<String>, endpoint: Endpoint, auth: AuthMaterial) -> Self {
        self.insert(site_id, endpoint, auth);
        self
    }

    pub fn insert(&self, site_id: impl Into<String>, endpoint: Endpoint, auth: AuthMaterial) {
        if let Ok(mut sites) = self.sites.write() {
            sites.insert(site_id.into(), (endpoint, auth));
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn resolve(&self, site_id: &str) -> TransferResult<(Endpoint, AuthMaterial)> {
        let sites = self
            .sites
            .read()
            .map_err(|_| TransferError::invalid_config("site table lock poisoned"))?;
        sites
            .get(site_id)
            .cloned()
            .ok_or_else(|| TransferError::invalid_job(format!("unknown site '{}'", site_id)))
    }
}

// ── Configuration ────────────────────────────────────────────────────

pub trait ConfigProvider: Send + Sync {
    /// A snapshot of the current settings.
    fn current(&self) -> EngineConfig;
}

/// `RwLock`-guarded configuration snapshot.
pub struct StaticConfigProvider {
    inner: RwLock<EngineConfig>,
}

impl StaticConfigProvider {
    pub fn new(config: EngineConfig) -> TransferResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: RwLock::new(config),
        })
    }

    /// Replace the settings; running jobs keep the snapshot they started
    /// with.
    pub fn update(&self, config: EngineConfig) -> TransferResult<()> {
        config.validate()?;
        let mut guard = self
            .inner
            .write()
            .map_err(|_| TransferError::invalid_config("config lock poisoned"))?;
        *guard = config;
        Ok(())
    }
}

impl Default for StaticConfigProvider {
    fn default() -> Self {
        Self {
            inner: RwLock::new(EngineConfig::default()),
        }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn current(&self) -> EngineConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// ── Host-key prompt ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    Accept,
    Reject,
}

#[async_trait]
pub trait HostKeyPrompt: Send + Sync {
    /// Asked only for fingerprints with no known-hosts record.
    async fn decide(&self, endpoint: &Endpoint, fingerprint: &str) -> HostKeyDecision;
}

/// Prompt used when no interactive collaborator is wired in.
pub struct RejectUnknownHosts;

#[async_trait]
impl HostKeyPrompt for RejectUnknownHosts {
    async fn decide(&self, endpoint: &Endpoint, fingerprint: &str) -> HostKeyDecision {
        log::warn!(
            "Rejecting unknown host key {} for {} (no prompt available)",
            fingerprint,
            endpoint.key()
        );
        HostKeyDecision::Reject
    }
}

// ── Local filesystem ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStat {
    pub size: u64,
    pub is_dir: bool,
}

/// Local side of every transfer. Failures surface as `ErrorCategory::Io`.
#[async_trait]
pub trait LocalFilesystem: Send + Sync {
    async fn open(&self, path: &Path, offset: u64) -> TransferResult<Box<dyn ChunkReader>>;

    /// Open for writing. `truncate` discards existing content; otherwise
    /// the file is cut to `offset` and writing continues there.
    async fn create(
        &self,
        path: &Path,
        offset: u64,
        truncate: bool,
    ) -> TransferResult<Box<dyn ChunkWriter>>;

    /// `None` when the path does not exist.
    async fn stat(&self, path: &Path) -> TransferResult<Option<LocalStat>>;

    async fn remove(&self, path: &Path) -> TransferResult<()>;

    async fn create_dir_all(&self, path: &Path) -> TransferResult<()>;

    /// Regular files below `root`, relative to it, in a stable order.
    async fn walk_files(&self, root: &Path) -> TransferResult<Vec<PathBuf>>;
}
