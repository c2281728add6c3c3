//! In-process session backend with scripted faults.
//!
//! A [`MemoryServer`] holds a flat file tree plus a fault script; the
//! [`MemorySessionFactory`] hands out sessions against it. Every byte range
//! read from or written to the server is recorded so tests can check that a
//! resumed transfer never moves the same bytes twice.

use async_trait::async_trait;
use pkd_core::{
    split_remote, verify_host_key, AuthMaterial, Capabilities, ChunkReader, ChunkWriter,
    ConnectContext, Endpoint, Entry, EntryKind, ProtocolSession, SessionFactory, TransferError,
    TransferResult,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// `[start, end)` of one read or write against a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Default)]
struct Faults {
    connect_errors: VecDeque<TransferError>,
    reject_auth: bool,
    drop_read_after: Option<u64>,
    drop_write_after: Option<u64>,
    chunk_delay: Option<Duration>,
    strict_transfers: bool,
}

struct ServerState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    modes: HashMap<String, u32>,
    capabilities: Capabilities,
    fingerprint: String,
    faults: Faults,
    reads: HashMap<String, Vec<ByteRange>>,
    writes: HashMap<String, Vec<ByteRange>>,
    connects: usize,
    live: usize,
    peak_live: usize,
    keepalives: usize,
}

/// Shared server state. Cheap to clone through `Arc`.
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            state: Mutex::new(ServerState {
                files: BTreeMap::new(),
                dirs,
                modes: HashMap::new(),
                capabilities: Capabilities::RESUME_READ | Capabilities::RESUME_WRITE,
                fingerprint: "SHA256:bWVtb3J5LXNlcnZlci1ob3N0LWtleQ".to_string(),
                faults: Faults::default(),
                reads: HashMap::new(),
                writes: HashMap::new(),
                connects: 0,
                live: 0,
                peak_live: 0,
                keepalives: 0,
            }),
        }
    }
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Content ──────────────────────────────────────────────────────

    pub fn put_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.state().files.insert(normalize(path), data.into());
    }

    pub fn put_dir(&self, path: &str) {
        self.state().dirs.insert(normalize(path));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(&normalize(path)).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state().dirs.contains(&normalize(path))
    }

    // ── Behaviour ────────────────────────────────────────────────────

    pub fn set_capabilities(&self, caps: Capabilities) {
        self.state().capabilities = caps;
    }

    pub fn set_fingerprint(&self, fingerprint: impl Into<String>) {
        self.state().fingerprint = fingerprint.into();
    }

    pub fn fingerprint(&self) -> String {
        self.state().fingerprint.clone()
    }

    /// The next `connect` calls fail with these errors, in order.
    pub fn fail_connects(&self, errors: impl IntoIterator<Item = TransferError>) {
        self.state().faults.connect_errors.extend(errors);
    }

    pub fn reject_auth(&self, reject: bool) {
        self.state().faults.reject_auth = reject;
    }

    /// One-shot: the first read that would move past byte `n` of a file
    /// drops the connection instead.
    pub fn drop_read_after(&self, n: u64) {
        self.state().faults.drop_read_after = Some(n);
    }

    /// One-shot: the first write that would extend a file past byte `n`
    /// drops the connection before the chunk is stored.
    pub fn drop_write_after(&self, n: u64) {
        self.state().faults.drop_write_after = Some(n);
    }

    /// When set, a session stays busy from `open_read`/`open_write` until
    /// the stream is finished or aborted, and refuses every other command
    /// meanwhile.
    pub fn require_transfer_completion(&self, on: bool) {
        self.state().faults.strict_transfers = on;
    }

    /// Sleep this long before serving each read or write.
    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        self.state().faults.chunk_delay = delay;
    }

    // ── Observations ─────────────────────────────────────────────────

    pub fn read_ranges(&self, path: &str) -> Vec<ByteRange> {
        self.state()
            .reads
            .get(&normalize(path))
            .cloned()
            .unwrap_or_default()
    }

    pub fn write_ranges(&self, path: &str) -> Vec<ByteRange> {
        self.state()
            .writes
            .get(&normalize(path))
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn live_sessions(&self) -> usize {
        self.state().live
    }

    pub fn peak_sessions(&self) -> usize {
        self.state().peak_live
    }

    pub fn keepalive_count(&self) -> usize {
        self.state().keepalives
    }

    fn chunk_delay(&self) -> Option<Duration> {
        self.state().faults.chunk_delay
    }
}

/// `true` when no two ranges overlap.
pub fn ranges_disjoint(ranges: &[ByteRange]) -> bool {
    let mut sorted: Vec<ByteRange> = ranges.iter().copied().filter(|r| !r.is_empty()).collect();
    sorted.sort_by_key(|r| r.start);
    sorted.windows(2).all(|w| w[0].end <= w[1].start)
}

// ── Factory ──────────────────────────────────────────────────────────

pub struct MemorySessionFactory {
    server: Arc<MemoryServer>,
}

impl MemorySessionFactory {
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        ctx: &ConnectContext,
    ) -> TransferResult<Box<dyn ProtocolSession>> {
        let (scripted, reject_auth, fingerprint) = {
            let mut state = self.server.state();
            state.connects += 1;
            (
                state.faults.connect_errors.pop_front(),
                state.faults.reject_auth,
                state.fingerprint.clone(),
            )
        };
        if let Some(err) = scripted {
            return Err(err);
        }
        if endpoint.protocol.is_ssh() {
            verify_host_key(
                endpoint,
                &fingerprint,
                ctx.known_hosts.as_ref(),
                ctx.host_key_prompt.as_ref(),
            )
            .await?;
        }
        if reject_auth {
            return Err(TransferError::auth_failed(format!(
                "login as {} refused",
                auth.username().unwrap_or("anonymous")
            )));
        }
        {
            let mut state = self.server.state();
            state.live += 1;
            state.peak_live = state.peak_live.max(state.live);
        }
        Ok(Box::new(MemorySession {
            server: self.server.clone(),
            endpoint: endpoint.clone(),
            closed: false,
            broken: false,
            busy: false,
        }))
    }
}

// ── Session ──────────────────────────────────────────────────────────

pub struct MemorySession {
    server: Arc<MemoryServer>,
    endpoint: Endpoint,
    closed: bool,
    broken: bool,
    /// A stream was opened and not yet finished or aborted.
    busy: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> TransferResult<()> {
        if self.closed || self.broken {
            return Err(TransferError::connection_reset("session is closed"));
        }
        Ok(())
    }

    fn ensure_idle(&self) -> TransferResult<()> {
        self.ensure_open()?;
        if self.busy {
            return Err(TransferError::connection_reset(
                "control connection busy with an abandoned transfer",
            ));
        }
        Ok(())
    }

    fn begin_transfer(&mut self) {
        self.busy = self.server.state().faults.strict_transfers;
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.server.state();
            state.live = state.live.saturating_sub(1);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

fn entry_for(state: &ServerState, path: &str) -> Option<Entry> {
    let (_, name) = split_remote(path);
    if let Some(data) = state.files.get(path) {
        let mut entry = Entry::new(name, path, EntryKind::File);
        entry.size = Some(data.len() as u64);
        entry.permissions = state.modes.get(path).copied();
        return Some(entry);
    }
    if state.dirs.contains(path) {
        let mut entry = Entry::new(name, path, EntryKind::Directory);
        entry.permissions = state.modes.get(path).copied();
        return Some(entry);
    }
    None
}

fn is_child(parent: &str, path: &str) -> bool {
    path != parent && split_remote(path).0 == parent
}

#[async_trait]
impl ProtocolSession for MemorySession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn capabilities(&self) -> Capabilities {
        self.server.state().capabilities
    }

    async fn list(&mut self, path: &str) -> TransferResult<Vec<Entry>> {
        self.ensure_idle()?;
        let dir = normalize(path);
        let state = self.server.state();
        if !state.dirs.contains(&dir) {
            return Err(TransferError::not_found(format!("{}: no such directory", dir)));
        }
        let children: BTreeSet<&String> = state
            .dirs
            .iter()
            .chain(state.files.keys())
            .filter(|p| is_child(&dir, p))
            .collect();
        Ok(children
            .into_iter()
            .filter_map(|p| entry_for(&state, p))
            .collect())
    }

    async fn stat(&mut self, path: &str) -> TransferResult<Entry> {
        self.ensure_idle()?;
        let path = normalize(path);
        entry_for(&self.server.state(), &path)
            .ok_or_else(|| TransferError::not_found(format!("{}: no such file", path)))
    }

    async fn open_read<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
    ) -> TransferResult<Box<dyn ChunkReader + 'a>> {
        self.ensure_idle()?;
        let path = normalize(path);
        {
            let state = self.server.state();
            if offset > 0 && !state.capabilities.contains(Capabilities::RESUME_READ) {
                return Err(TransferError::unsupported("offset reads are disabled"));
            }
            if !state.files.contains_key(&path) {
                return Err(TransferError::not_found(format!("{}: no such file", path)));
            }
        }
        self.begin_transfer();
        Ok(Box::new(MemoryReader {
            session: self,
            path,
            pos: offset,
        }))
    }

    async fn open_write<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
        truncate: bool,
    ) -> TransferResult<Box<dyn ChunkWriter + 'a>> {
        self.ensure_idle()?;
        let path = normalize(path);
        let pos = {
            let mut state = self.server.state();
            if truncate {
                state.files.insert(path.clone(), Vec::new());
                0
            } else {
                if offset > 0 && !state.capabilities.contains(Capabilities::RESUME_WRITE) {
                    return Err(TransferError::unsupported("offset writes are disabled"));
                }
                let file = state.files.entry(path.clone()).or_default();
                if (file.len() as u64) < offset {
                    return Err(TransferError::new(
                        pkd_core::ErrorKind::ResumeMismatch,
                        format!("{} holds {} bytes, cannot write at {}", path, file.len(), offset),
                    ));
                }
                file.truncate(offset as usize);
                offset
            }
        };
        self.begin_transfer();
        Ok(Box::new(MemoryWriter {
            session: self,
            path,
            pos,
        }))
    }

    async fn mkdir(&mut self, path: &str) -> TransferResult<()> {
        self.ensure_idle()?;
        let path = normalize(path);
        let mut state = self.server.state();
        if state.dirs.contains(&path) || state.files.contains_key(&path) {
            return Err(TransferError::protocol(format!("{} already exists", path)));
        }
        state.dirs.insert(path);
        Ok(())
    }

    async fn remove(&mut self, path: &str) -> TransferResult<()> {
        self.ensure_idle()?;
        let path = normalize(path);
        let mut state = self.server.state();
        if state.files.remove(&path).is_some() {
            return Ok(());
        }
        if state.dirs.contains(&path) {
            let busy = state
                .dirs
                .iter()
                .chain(state.files.keys())
                .any(|p| is_child(&path, p));
            if busy {
                return Err(TransferError::protocol(format!("{} is not empty", path)));
            }
            state.dirs.remove(&path);
            return Ok(());
        }
        Err(TransferError::not_found(format!("{}: no such file", path)))
    }

    async fn rename(&mut self, from: &str, to: &str) -> TransferResult<()> {
        self.ensure_idle()?;
        let (from, to) = (normalize(from), normalize(to));
        let mut state = self.server.state();
        match state.files.remove(&from) {
            Some(data) => {
                state.files.insert(to, data);
                Ok(())
            }
            None => Err(TransferError::not_found(format!("{}: no such file", from))),
        }
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> TransferResult<()> {
        self.ensure_idle()?;
        let path = normalize(path);
        let mut state = self.server.state();
        if entry_for(&state, &path).is_none() {
            return Err(TransferError::not_found(format!("{}: no such file", path)));
        }
        state.modes.insert(path, mode & 0o7777);
        Ok(())
    }

    async fn close(&mut self) -> TransferResult<()> {
        self.release();
        Ok(())
    }

    async fn keepalive(&mut self) -> TransferResult<()> {
        self.ensure_idle()?;
        self.server.state().keepalives += 1;
        Ok(())
    }

    fn is_reusable(&self) -> bool {
        !self.closed && !self.broken && !self.busy
    }
}

struct MemoryReader<'a> {
    session: &'a mut MemorySession,
    path: String,
    pos: u64,
}

#[async_trait]
impl<'a> ChunkReader for MemoryReader<'a> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        self.session.ensure_open()?;
        if let Some(delay) = self.session.server.chunk_delay() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.session.server.state();
        let data = state
            .files
            .get(&self.path)
            .ok_or_else(|| TransferError::not_found(format!("{} vanished", self.path)))?;
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        if n == 0 {
            return Ok(0);
        }
        buf[..n].copy_from_slice(&data[start..start + n]);
        let end = self.pos + n as u64;
        if let Some(limit) = state.faults.drop_read_after {
            if end > limit {
                state.faults.drop_read_after = None;
                drop(state);
                self.session.broken = true;
                return Err(TransferError::connection_reset(format!(
                    "connection dropped while reading {} at {}",
                    self.path, self.pos
                )));
            }
        }
        state.reads.entry(self.path.clone()).or_default().push(ByteRange {
            start: self.pos,
            end,
        });
        self.pos = end;
        Ok(n)
    }

    async fn finish(self: Box<Self>) -> TransferResult<()> {
        self.session.busy = false;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> TransferResult<()> {
        self.session.busy = false;
        Ok(())
    }
}

struct MemoryWriter<'a> {
    session: &'a mut MemorySession,
    path: String,
    pos: u64,
}

#[async_trait]
impl<'a> ChunkWriter for MemoryWriter<'a> {
    async fn write_chunk(&mut self, data: &[u8]) -> TransferResult<()> {
        self.session.ensure_open()?;
        if let Some(delay) = self.session.server.chunk_delay() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.session.server.state();
        let end = self.pos + data.len() as u64;
        if let Some(limit) = state.faults.drop_write_after {
            if end > limit {
                state.faults.drop_write_after = None;
                drop(state);
                self.session.broken = true;
                return Err(TransferError::connection_reset(format!(
                    "connection dropped while writing {} at {}",
                    self.path, self.pos
                )));
            }
        }
        let file = state.files.entry(self.path.clone()).or_default();
        file.truncate(self.pos as usize);
        file.extend_from_slice(data);
        state.writes.entry(self.path.clone()).or_default().push(ByteRange {
            start: self.pos,
            end,
        });
        self.pos = end;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> TransferResult<()> {
        self.session.ensure_open()?;
        self.session.busy = false;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> TransferResult<()> {
        self.session.busy = false;
        Ok(())
    }
}
