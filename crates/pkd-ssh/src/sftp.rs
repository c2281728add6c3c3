//! `ProtocolSession` over the SFTP subsystem.

use crate::blocking;
use crate::connection::SshConnection;
use crate::error::{map_remote_io, map_ssh_error};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pkd_core::{
    join_remote, split_remote, AuthMaterial, Capabilities, ChunkReader, ChunkWriter,
    ConnectContext, Endpoint, Entry, EntryKind, ProtocolSession, TransferError, TransferResult,
};
use ssh2::{File, FileStat, OpenFlags, OpenType, Sftp};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct SftpSession {
    conn: SshConnection,
    sftp: Arc<Sftp>,
    endpoint: Endpoint,
    closed: bool,
}

impl SftpSession {
    pub async fn connect(
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        ctx: &ConnectContext,
    ) -> TransferResult<Self> {
        let conn = SshConnection::connect(endpoint, auth, ctx).await?;
        let session = conn.session().clone();
        let sftp = blocking(move || {
            session
                .sftp()
                .map_err(|e| map_ssh_error("SFTP subsystem unavailable", &e))
        })
        .await?;
        Ok(Self {
            conn,
            sftp: Arc::new(sftp),
            endpoint: endpoint.clone(),
            closed: false,
        })
    }

    /// Run `f` with the SFTP channel on the blocking pool.
    async fn with_sftp<T, F>(&self, f: F) -> TransferResult<T>
    where
        F: FnOnce(&Sftp) -> TransferResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed {
            return Err(TransferError::connection_reset("session is closed"));
        }
        let sftp = self.sftp.clone();
        blocking(move || f(&sftp)).await
    }
}

fn entry_kind(stat: &FileStat) -> EntryKind {
    let ft = stat.file_type();
    if ft.is_dir() {
        EntryKind::Directory
    } else if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

/// Map an SFTP attribute block; fields the server omitted stay `None`.
pub fn entry_from_stat(name: &str, path: &str, stat: &FileStat) -> Entry {
    let kind = entry_kind(stat);
    let mut entry = Entry::new(name, path, kind);
    entry.size = if kind == EntryKind::Directory {
        None
    } else {
        stat.size
    };
    entry.modified = stat
        .mtime
        .and_then(|t| Utc.timestamp_opt(t as i64, 0).single());
    entry.permissions = stat.perm.map(|p| p & 0o7777);
    entry
}

fn chmod_stat(mode: u32) -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: Some(mode & 0o7777),
        atime: None,
        mtime: None,
    }
}

#[async_trait]
impl ProtocolSession for SftpSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::RESUME_READ | Capabilities::RESUME_WRITE
    }

    async fn list(&mut self, path: &str) -> TransferResult<Vec<Entry>> {
        let dir = path.to_string();
        self.with_sftp(move |sftp| {
            let raw = sftp
                .readdir(Path::new(&dir))
                .map_err(|e| map_ssh_error(&format!("readdir {}", dir), &e))?;
            Ok(raw
                .into_iter()
                .filter_map(|(p, stat)| {
                    let name = p.file_name()?.to_string_lossy().to_string();
                    if name == "." || name == ".." {
                        return None;
                    }
                    Some(entry_from_stat(&name, &join_remote(&dir, &name), &stat))
                })
                .collect())
        })
        .await
    }

    async fn stat(&mut self, path: &str) -> TransferResult<Entry> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let stat = sftp
                .stat(Path::new(&path))
                .map_err(|e| map_ssh_error(&format!("stat {}", path), &e))?;
            let (_, name) = split_remote(&path);
            Ok(entry_from_stat(name, &path, &stat))
        })
        .await
    }

    async fn open_read<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
    ) -> TransferResult<Box<dyn ChunkReader + 'a>> {
        let path = path.to_string();
        let file = self
            .with_sftp(move |sftp| {
                let mut file = sftp
                    .open(Path::new(&path))
                    .map_err(|e| map_ssh_error(&format!("open {}", path), &e))?;
                if offset > 0 {
                    file.seek(SeekFrom::Start(offset))
                        .map_err(|e| map_remote_io("seek", e))?;
                }
                Ok(file)
            })
            .await?;
        Ok(Box::new(SftpReader { file: Some(file) }))
    }

    async fn open_write<'a>(
        &'a mut self,
        path: &str,
        offset: u64,
        truncate: bool,
    ) -> TransferResult<Box<dyn ChunkWriter + 'a>> {
        let path = path.to_string();
        let file = self
            .with_sftp(move |sftp| {
                let mut flags = OpenFlags::WRITE | OpenFlags::CREATE;
                if truncate {
                    flags |= OpenFlags::TRUNCATE;
                }
                let mut file = sftp
                    .open_mode(Path::new(&path), flags, 0o644, OpenType::File)
                    .map_err(|e| map_ssh_error(&format!("open {} for writing", path), &e))?;
                if !truncate && offset > 0 {
                    file.seek(SeekFrom::Start(offset))
                        .map_err(|e| map_remote_io("seek", e))?;
                }
                Ok(file)
            })
            .await?;
        Ok(Box::new(SftpWriter { file: Some(file) }))
    }

    async fn mkdir(&mut self, path: &str) -> TransferResult<()> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            sftp.mkdir(Path::new(&path), 0o755)
                .map_err(|e| map_ssh_error(&format!("mkdir {}", path), &e))
        })
        .await
    }

    async fn remove(&mut self, path: &str) -> TransferResult<()> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            let p = Path::new(&path);
            let stat = sftp
                .lstat(p)
                .map_err(|e| map_ssh_error(&format!("lstat {}", path), &e))?;
            let result = if stat.file_type().is_dir() {
                sftp.rmdir(p)
            } else {
                sftp.unlink(p)
            };
            result.map_err(|e| map_ssh_error(&format!("remove {}", path), &e))
        })
        .await
    }

    async fn rename(&mut self, from: &str, to: &str) -> TransferResult<()> {
        let (from, to) = (PathBuf::from(from), PathBuf::from(to));
        self.with_sftp(move |sftp| {
            sftp.rename(&from, &to, None).map_err(|e| {
                map_ssh_error(
                    &format!("rename {} -> {}", from.display(), to.display()),
                    &e,
                )
            })
        })
        .await
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> TransferResult<()> {
        let path = path.to_string();
        self.with_sftp(move |sftp| {
            sftp.setstat(Path::new(&path), chmod_stat(mode))
                .map_err(|e| map_ssh_error(&format!("chmod {}", path), &e))
        })
        .await
    }

    async fn close(&mut self) -> TransferResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        log::debug!("closing SFTP session to {}", self.endpoint.key());
        self.conn.disconnect().await
    }

    async fn keepalive(&mut self) -> TransferResult<()> {
        self.conn.keepalive().await
    }

    fn is_reusable(&self) -> bool {
        !self.closed
    }
}

// ─── Remote file reader / writer ─────────────────────────────────────

struct SftpReader {
    file: Option<File>,
}

#[async_trait]
impl ChunkReader for SftpReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        let Some(mut file) = self.file.take() else {
            return Ok(0);
        };
        let len = buf.len();
        let (file, chunk) = blocking(move || {
            let mut chunk = vec![0u8; len];
            let n = file.read(&mut chunk).map_err(|e| map_remote_io("read", e))?;
            chunk.truncate(n);
            Ok((file, chunk))
        })
        .await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        self.file = Some(file);
        Ok(chunk.len())
    }

    async fn finish(mut self: Box<Self>) -> TransferResult<()> {
        if let Some(mut file) = self.file.take() {
            blocking(move || file.close().map_err(|e| map_ssh_error("close", &e))).await?;
        }
        Ok(())
    }
}

struct SftpWriter {
    file: Option<File>,
}

#[async_trait]
impl ChunkWriter for SftpWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> TransferResult<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| TransferError::protocol("write after finish"))?;
        let chunk = data.to_vec();
        let file = blocking(move || {
            file.write_all(&chunk)
                .map_err(|e| map_remote_io("write", e))?;
            Ok(file)
        })
        .await?;
        self.file = Some(file);
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> TransferResult<()> {
        if let Some(mut file) = self.file.take() {
            blocking(move || {
                file.flush().map_err(|e| map_remote_io("flush", e))?;
                file.close().map_err(|e| map_ssh_error("close", &e))
            })
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(perm: u32, size: u64) -> FileStat {
        FileStat {
            size: Some(size),
            uid: None,
            gid: None,
            perm: Some(perm),
            atime: None,
            mtime: Some(1_700_000_000),
        }
    }

    #[test]
    fn regular_file_maps_all_fields() {
        let e = entry_from_stat("a.txt", "/home/a.txt", &stat(0o100644, 12));
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, Some(12));
        assert_eq!(e.permissions, Some(0o644));
        assert_eq!(e.modified.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn directory_and_symlink_kinds() {
        let d = entry_from_stat("src", "/src", &stat(0o040755, 4096));
        assert!(d.is_dir());
        assert_eq!(d.size, None);
        let l = entry_from_stat("ln", "/ln", &stat(0o120777, 3));
        assert_eq!(l.kind, EntryKind::Symlink);
    }

    #[test]
    fn missing_attributes_stay_absent() {
        let bare = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: None,
            mtime: None,
        };
        let e = entry_from_stat("x", "/x", &bare);
        assert_eq!(e.size, None);
        assert_eq!(e.modified, None);
        assert_eq!(e.permissions, None);
    }

    #[test]
    fn chmod_only_sets_permission_bits() {
        let s = chmod_stat(0o100755);
        assert_eq!(s.perm, Some(0o755));
        assert!(s.size.is_none() && s.mtime.is_none());
    }
}
