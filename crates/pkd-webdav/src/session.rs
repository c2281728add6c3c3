//! `ProtocolSession` for WebDAV.
//!
//! Downloads resume through ranged `GET` when the server advertises
//! `Accept-Ranges: bytes`; uploads resume only on servers offering sabre/dav
//! partial updates. Everything else restarts from zero.

use crate::client::{DavClient, ServerFeatures};
use crate::xml::{href_to_path, DavResource};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use pkd_core::{
    split_remote, AuthMaterial, Capabilities, ChunkReader, ChunkWriter, ConnectContext, Endpoint,
    Entry, EntryKind, ProtocolSession, TransferError, TransferResult,
};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

pub struct WebDavSession {
    client: DavClient,
    endpoint: Endpoint,
    features: ServerFeatures,
    base_path: String,
    closed: bool,
}

impl WebDavSession {
    pub async fn connect(
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        ctx: &ConnectContext,
    ) -> TransferResult<Self> {
        let client = DavClient::new(endpoint, auth, ctx.timeout)?;
        let features = client.options().await?;
        let base_path = client.base().path().to_string();
        log::info!(
            "WebDAV session ready on {} (base {}, {:?})",
            endpoint.key(),
            client.base(),
            features
        );
        Ok(Self {
            client,
            endpoint: endpoint.clone(),
            features,
            base_path,
            closed: false,
        })
    }

    fn ensure_open(&self) -> TransferResult<()> {
        if self.closed {
            return Err(TransferError::connection_reset("session is closed"));
        }
        Ok(())
    }

    fn to_entry(&self, res: &DavResource) -> Entry {
        let path = href_to_path(&res.href, &self.base_path);
        let (_, name) = split_remote(&path);
        let kind = if res.is_collection {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let mut entry = Entry::new(name, path.as_str(), kind);
        entry.size = if res.is_collection {
            None
        } else {
            res.content_length
        };
        entry.modified = res.last_modified;
        entry
    }
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

#[async_trait]
impl ProtocolSession for WebDavSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        if self.features.ranges {
            caps.insert(Capabilities::RESUME_READ);
        }
        if self.features.partial_update {
            caps.insert(Capabilities::RESUME_WRITE);
        }
        caps
    }

    async fn list(&mut self, path: &str) -> TransferResult<Vec<Entry>> {
        self.ensure_open()?;
        let own = normalize(path);
        let resources = self.client.propfind(path, 1).await?;
        Ok(resources
            .iter()
            .filter(|r| r.found)
            .map(|r| self.to_entry(r))
            .filter(|e| e.path != own)
            .collect())
    }

    async fn stat(&mut self, path: &str) -> TransferResult<Entry> {
        self.ensure_open()?;
        let resources = self.client.propfind(path, 0).await?;
        resources
            .iter()
            .find(|r| r.found)
            .map(|r| self.to_entry(r))
            .ok_or_else(|| TransferError::not_found(format!("{} has no properties", path)))
    }

    async fn open_read<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
    ) -> TransferResult<Box<dyn ChunkReader + 'a>> {
        self.ensure_open()?;
        if offset > 0 && !self.features.ranges {
            return Err(TransferError::unsupported(
                "server does not accept byte ranges",
            ));
        }
        let resp = self.client.get(path, offset).await?;
        log::debug!("GET {} from offset {}", path, offset);
        Ok(Box::new(DavReader {
            stream: resp.bytes_stream().boxed(),
            pending: Bytes::new(),
            limit: self.client.io_timeout(),
            context: format!("GET {}", path),
        }))
    }

    async fn open_write<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
        truncate: bool,
    ) -> TransferResult<Box<dyn ChunkWriter + 'a>> {
        self.ensure_open()?;
        let offset = if truncate { 0 } else { offset };
        if offset > 0 && !self.features.partial_update {
            return Err(TransferError::unsupported(
                "server does not support partial updates",
            ));
        }
        // One chunk in flight bounds the buffering between worker and request.
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
        let req = self
            .client
            .upload_request(path, offset, ReceiverStream::new(rx))?;
        let context = if offset > 0 {
            format!("PATCH {}", path)
        } else {
            format!("PUT {}", path)
        };
        let send_context = context.clone();
        let client = self.client.clone();
        let task = tokio::spawn(async move { client.send_upload(req, &send_context).await });
        log::debug!("{} from offset {}", context, offset);
        Ok(Box::new(DavWriter {
            tx: Some(tx),
            task: Some(task),
            limit: self.client.io_timeout(),
            context,
        }))
    }

    async fn mkdir(&mut self, path: &str) -> TransferResult<()> {
        self.ensure_open()?;
        self.client.mkcol(path).await
    }

    async fn remove(&mut self, path: &str) -> TransferResult<()> {
        self.ensure_open()?;
        // DELETE on a collection is recursive; refuse non-empty directories.
        let entry = self.stat(path).await?;
        if entry.is_dir() && !self.list(path).await?.is_empty() {
            return Err(TransferError::protocol(format!(
                "directory {} is not empty",
                path
            )));
        }
        self.client.delete(path).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> TransferResult<()> {
        self.ensure_open()?;
        self.client.move_to(from, to).await
    }

    async fn chmod(&mut self, _path: &str, _mode: u32) -> TransferResult<()> {
        Err(TransferError::unsupported(
            "WebDAV has no permission bits",
        ))
    }

    async fn close(&mut self) -> TransferResult<()> {
        self.closed = true;
        Ok(())
    }

    async fn keepalive(&mut self) -> TransferResult<()> {
        self.ensure_open()?;
        self.client.options().await.map(|_| ())
    }

    fn is_reusable(&self) -> bool {
        !self.closed
    }
}

// ─── Streaming reader / writer ───────────────────────────────────────

struct DavReader {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    pending: Bytes,
    limit: Duration,
    context: String,
}

#[async_trait]
impl ChunkReader for DavReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        while self.pending.is_empty() {
            match tokio::time::timeout(self.limit, self.stream.next()).await {
                Err(_) => {
                    return Err(TransferError::timeout(format!(
                        "{}: no data for {:?}",
                        self.context, self.limit
                    )))
                }
                Ok(None) => return Ok(0),
                Ok(Some(Err(e))) => return Err(crate::client::map_reqwest(&self.context, &e)),
                Ok(Some(Ok(bytes))) => self.pending = bytes,
            }
        }
        let n = buf.len().min(self.pending.len());
        let chunk = self.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }
}

struct DavWriter {
    tx: Option<mpsc::Sender<Result<Bytes, io::Error>>>,
    task: Option<JoinHandle<TransferResult<()>>>,
    limit: Duration,
    context: String,
}

impl DavWriter {
    /// The request ended early; surface its error.
    async fn request_outcome(&mut self) -> TransferError {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(Err(e)) => e,
                Ok(Ok(())) => TransferError::protocol(format!(
                    "{}: server completed the upload before the body ended",
                    self.context
                )),
                Err(e) => TransferError::connection_reset(format!("{}: {}", self.context, e)),
            },
            None => TransferError::protocol("write after finish"),
        }
    }
}

#[async_trait]
impl ChunkWriter for DavWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> TransferResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(TransferError::protocol("write after finish"));
        };
        let chunk = Bytes::copy_from_slice(data);
        match tokio::time::timeout(self.limit, tx.send(Ok(chunk))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.tx = None;
                Err(self.request_outcome().await)
            }
            Err(_) => Err(TransferError::timeout(format!(
                "{}: server stopped accepting data",
                self.context
            ))),
        }
    }

    async fn finish(mut self: Box<Self>) -> TransferResult<()> {
        // Dropping the sender ends the request body.
        self.tx = None;
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(self.limit, task).await {
            Ok(joined) => joined
                .map_err(|e| TransferError::connection_reset(format!("{}: {}", self.context, e)))?,
            Err(_) => Err(TransferError::timeout(format!(
                "{}: no response after upload",
                self.context
            ))),
        }
    }
}

impl Drop for DavWriter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
