//! `ProtocolSession` over SCP.
//!
//! Whole-file downloads use the SCP protocol itself. SCP needs the file
//! size before the first byte is sent, so uploads stream through
//! `cat` on an exec channel instead; resumed transfers use `tail -c` and
//! `cat >>`. Metadata operations are plain shell commands.

use crate::blocking;
use crate::connection::SshConnection;
use crate::error::{map_remote_io, map_remote_stderr, map_ssh_error};
use crate::remote::{self, shell_escape};
use async_trait::async_trait;
use pkd_core::{
    AuthMaterial, Capabilities, ChunkReader, ChunkWriter, ConnectContext, Endpoint, Entry,
    ErrorKind, ProtocolSession, TransferError, TransferResult,
};
use ssh2::{Channel, Session};
use std::io::{Read, Write};
use std::path::Path;

pub struct ScpSession {
    conn: SshConnection,
    endpoint: Endpoint,
    closed: bool,
}

impl ScpSession {
    pub async fn connect(
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        ctx: &ConnectContext,
    ) -> TransferResult<Self> {
        let conn = SshConnection::connect(endpoint, auth, ctx).await?;
        Ok(Self {
            conn,
            endpoint: endpoint.clone(),
            closed: false,
        })
    }

    fn session(&self) -> TransferResult<&Session> {
        if self.closed {
            return Err(TransferError::connection_reset("session is closed"));
        }
        Ok(self.conn.session())
    }

    async fn run(&self, context: &str, command: String) -> TransferResult<String> {
        remote::exec_ok(self.session()?, context, command).await
    }
}

/// Open an exec channel running `command`.
async fn exec_channel(session: &Session, command: String) -> TransferResult<Channel> {
    let session = session.clone();
    blocking(move || {
        let mut channel = session
            .channel_session()
            .map_err(|e| map_ssh_error("failed to open channel", &e))?;
        channel
            .exec(&command)
            .map_err(|e| map_ssh_error("failed to start remote command", &e))?;
        Ok(channel)
    })
    .await
}

/// Wait for a command channel to finish and turn a failure exit into an error.
fn close_command(channel: &mut Channel, context: &str) -> TransferResult<()> {
    channel
        .wait_close()
        .map_err(|e| map_ssh_error("closing channel", &e))?;
    let status = channel
        .exit_status()
        .map_err(|e| map_ssh_error("reading exit status", &e))?;
    if status != 0 {
        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);
        return Err(map_remote_stderr(context, &stderr));
    }
    Ok(())
}

pub fn read_command(path: &str, offset: u64) -> String {
    format!("tail -c +{} {}", offset + 1, shell_escape(path))
}

pub fn write_command(path: &str, append: bool) -> String {
    let redirect = if append { ">>" } else { ">" };
    format!("cat {} {}", redirect, shell_escape(path))
}

pub fn remove_command(path: &str) -> String {
    let p = shell_escape(path);
    format!("if [ -d {p} ]; then rmdir {p}; else rm {p}; fi", p = p)
}

#[async_trait]
impl ProtocolSession for ScpSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::RESUME_READ | Capabilities::RESUME_WRITE
    }

    async fn list(&mut self, path: &str) -> TransferResult<Vec<Entry>> {
        let out = self.run("list", remote::list_command(path)).await?;
        Ok(remote::parse_find_output(path, &out))
    }

    async fn stat(&mut self, path: &str) -> TransferResult<Entry> {
        let out = self.run("stat", remote::stat_command(path)).await?;
        remote::parse_stat_output(path, &out)
    }

    async fn open_read<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
    ) -> TransferResult<Box<dyn ChunkReader + 'a>> {
        let session = self.session()?.clone();
        if offset > 0 {
            let channel = exec_channel(&session, read_command(path, offset)).await?;
            log::debug!("SCP resume read of {} from {}", path, offset);
            return Ok(Box::new(ScpReader {
                channel: Some(channel),
                remaining: None,
                context: format!("read {}", path),
            }));
        }
        let remote_path = path.to_string();
        let (channel, size) = blocking(move || {
            let (channel, stat) = session
                .scp_recv(Path::new(&remote_path))
                .map_err(|e| map_ssh_error(&format!("scp receive {}", remote_path), &e))?;
            Ok((channel, stat.size()))
        })
        .await?;
        log::debug!("SCP receive {} ({} bytes)", path, size);
        Ok(Box::new(ScpReader {
            channel: Some(channel),
            remaining: Some(size),
            context: format!("read {}", path),
        }))
    }

    async fn open_write<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
        truncate: bool,
    ) -> TransferResult<Box<dyn ChunkWriter + 'a>> {
        let append = !truncate && offset > 0;
        if append {
            // `cat >>` writes at the current end, which must be the offset.
            let current = self.stat(path).await?.size.unwrap_or(0);
            if current != offset {
                return Err(TransferError::new(
                    ErrorKind::ResumeMismatch,
                    format!(
                        "remote {} holds {} bytes, cannot continue at {}",
                        path, current, offset
                    ),
                ));
            }
        }
        let channel = exec_channel(self.session()?, write_command(path, append)).await?;
        Ok(Box::new(ScpWriter {
            channel: Some(channel),
            context: format!("write {}", path),
        }))
    }

    async fn mkdir(&mut self, path: &str) -> TransferResult<()> {
        self.run("mkdir", format!("mkdir {}", shell_escape(path)))
            .await
            .map(|_| ())
    }

    async fn remove(&mut self, path: &str) -> TransferResult<()> {
        self.run("remove", remove_command(path)).await.map(|_| ())
    }

    async fn rename(&mut self, from: &str, to: &str) -> TransferResult<()> {
        self.run(
            "rename",
            format!("mv -f -- {} {}", shell_escape(from), shell_escape(to)),
        )
        .await
        .map(|_| ())
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> TransferResult<()> {
        self.run(
            "chmod",
            format!("chmod {:o} -- {}", mode & 0o7777, shell_escape(path)),
        )
        .await
        .map(|_| ())
    }

    async fn close(&mut self) -> TransferResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        log::debug!("closing SCP session to {}", self.endpoint.key());
        self.conn.disconnect().await
    }

    async fn keepalive(&mut self) -> TransferResult<()> {
        self.conn.keepalive().await
    }

    fn is_reusable(&self) -> bool {
        !self.closed
    }
}

// ─── Channel reader / writer ─────────────────────────────────────────

struct ScpReader {
    channel: Option<Channel>,
    /// Bytes left in an SCP stream; `None` for command output read to EOF.
    remaining: Option<u64>,
    context: String,
}

#[async_trait]
impl ChunkReader for ScpReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        let want = match self.remaining {
            Some(left) => buf.len().min(left.min(usize::MAX as u64) as usize),
            None => buf.len(),
        };
        if want == 0 {
            return Ok(0);
        }
        let Some(mut channel) = self.channel.take() else {
            return Ok(0);
        };
        let (channel, chunk) = blocking(move || {
            let mut chunk = vec![0u8; want];
            let n = channel
                .read(&mut chunk)
                .map_err(|e| map_remote_io("read", e))?;
            chunk.truncate(n);
            Ok((channel, chunk))
        })
        .await?;
        self.channel = Some(channel);
        let n = chunk.len();
        buf[..n].copy_from_slice(&chunk);
        if let Some(left) = self.remaining.as_mut() {
            if n == 0 && *left > 0 {
                return Err(TransferError::connection_reset(format!(
                    "{}: stream ended {} bytes early",
                    self.context, left
                )));
            }
            *left -= n as u64;
        }
        Ok(n)
    }

    async fn finish(mut self: Box<Self>) -> TransferResult<()> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };
        let scp = self.remaining.is_some();
        let context = self.context.clone();
        blocking(move || {
            if scp {
                channel
                    .send_eof()
                    .map_err(|e| map_ssh_error("sending EOF", &e))?;
                channel
                    .wait_eof()
                    .map_err(|e| map_ssh_error("waiting for EOF", &e))?;
                channel
                    .close()
                    .map_err(|e| map_ssh_error("closing channel", &e))?;
                channel
                    .wait_close()
                    .map_err(|e| map_ssh_error("closing channel", &e))
            } else {
                close_command(&mut channel, &context)
            }
        })
        .await
    }
}

struct ScpWriter {
    channel: Option<Channel>,
    context: String,
}

#[async_trait]
impl ChunkWriter for ScpWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> TransferResult<()> {
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| TransferError::protocol("write after finish"))?;
        let chunk = data.to_vec();
        let channel = blocking(move || {
            channel
                .write_all(&chunk)
                .map_err(|e| map_remote_io("write", e))?;
            Ok(channel)
        })
        .await?;
        self.channel = Some(channel);
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> TransferResult<()> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };
        let context = self.context.clone();
        blocking(move || {
            channel.flush().map_err(|e| map_remote_io("flush", e))?;
            channel
                .send_eof()
                .map_err(|e| map_ssh_error("sending EOF", &e))?;
            channel
                .wait_eof()
                .map_err(|e| map_ssh_error("waiting for EOF", &e))?;
            close_command(&mut channel, &context)
        })
        .await
    }
}
