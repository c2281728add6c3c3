//! The capability set every protocol variant implements.

use crate::error::TransferResult;
use crate::host_keys::KnownHosts;
use crate::providers::HostKeyPrompt;
use crate::types::{AuthMaterial, Capabilities, Endpoint, Entry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A source of bytes read one chunk at a time.
#[async_trait]
pub trait ChunkReader: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> TransferResult<usize>;

    /// Complete the stream after EOF (e.g. consume a trailing status reply).
    async fn finish(self: Box<Self>) -> TransferResult<()> {
        Ok(())
    }

    /// Abandon the stream before EOF and return the session to an idle
    /// state.
    async fn abort(self: Box<Self>) -> TransferResult<()> {
        Ok(())
    }
}

/// A sink of bytes written one chunk at a time. Bytes are acknowledged
/// once `write_chunk` returns; `finish` flushes and confirms the whole
/// transfer with the peer.
#[async_trait]
pub trait ChunkWriter: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> TransferResult<()>;

    async fn finish(self: Box<Self>) -> TransferResult<()>;

    /// Abandon the transfer without confirming it. Bytes already written
    /// stay at the destination.
    async fn abort(self: Box<Self>) -> TransferResult<()> {
        Ok(())
    }
}

/// Fill `buf` completely unless the stream ends first.
pub async fn read_full(
    reader: &mut (dyn ChunkReader + '_),
    buf: &mut [u8],
) -> TransferResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read_chunk(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A live, authenticated connection to one endpoint.
///
/// A session is used by one worker at a time; readers and writers borrow
/// it mutably for the duration of a transfer.
#[async_trait]
pub trait ProtocolSession: Send {
    fn endpoint(&self) -> &Endpoint;

    fn capabilities(&self) -> Capabilities;

    /// Directory listing, without `.` and `..`.
    async fn list(&mut self, path: &str) -> TransferResult<Vec<Entry>>;

    /// Metadata for one path; `ErrorKind::NotFound` if it does not exist.
    async fn stat(&mut self, path: &str) -> TransferResult<Entry>;

    /// Stream a remote file starting at `offset`. A non-zero offset on a
    /// session without `RESUME_READ` fails with `ErrorKind::Unsupported`.
    async fn open_read<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
    ) -> TransferResult<Box<dyn ChunkReader + 'a>>;

    /// Open a remote sink. `truncate` discards existing content; otherwise
    /// writing continues at `offset`, which requires `RESUME_WRITE` when
    /// non-zero.
    async fn open_write<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
        truncate: bool,
    ) -> TransferResult<Box<dyn ChunkWriter + 'a>>;

    async fn mkdir(&mut self, path: &str) -> TransferResult<()>;

    /// Remove a file or an empty directory.
    async fn remove(&mut self, path: &str) -> TransferResult<()>;

    async fn rename(&mut self, from: &str, to: &str) -> TransferResult<()>;

    async fn chmod(&mut self, path: &str, mode: u32) -> TransferResult<()>;

    /// Idempotent.
    async fn close(&mut self) -> TransferResult<()>;

    /// Cheap round-trip keeping an idle pooled connection open.
    async fn keepalive(&mut self) -> TransferResult<()> {
        Ok(())
    }

    /// `false` once the connection is in a state where it must not be
    /// handed to another job (e.g. a transfer was abandoned mid-stream).
    fn is_reusable(&self) -> bool {
        true
    }
}

/// Per-connect settings handed to a [`SessionFactory`].
#[derive(Clone)]
pub struct ConnectContext {
    pub timeout: Duration,
    pub keepalive: Duration,
    pub known_hosts: Arc<dyn KnownHosts>,
    pub host_key_prompt: Arc<dyn HostKeyPrompt>,
}

/// Opens sessions for endpoints. The engine depends only on this seam.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        ctx: &ConnectContext,
    ) -> TransferResult<Box<dyn ProtocolSession>>;
}
