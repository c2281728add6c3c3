//! `LocalFilesystem` over `tokio::fs`.

use async_trait::async_trait;
use pkd_core::{
    ChunkReader, ChunkWriter, ErrorCategory, LocalFilesystem, LocalStat, TransferError,
    TransferResult,
};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Local failures always land in the I/O category, whatever `io::ErrorKind`
/// the OS picked.
fn local_error(context: &str, path: &Path, e: io::Error) -> TransferError {
    let mapped = TransferError::from(e);
    let message = format!("{} {}: {}", context, path.display(), mapped.message);
    if mapped.category() == ErrorCategory::Io {
        TransferError::new(mapped.kind, message)
    } else {
        TransferError::local_io(message)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFilesystem;

impl TokioFilesystem {
    pub fn new() -> Self {
        TokioFilesystem
    }
}

#[async_trait]
impl LocalFilesystem for TokioFilesystem {
    async fn open(&self, path: &Path, offset: u64) -> TransferResult<Box<dyn ChunkReader>> {
        let mut file = File::open(path)
            .await
            .map_err(|e| local_error("open", path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| local_error("seek", path, e))?;
        }
        Ok(Box::new(LocalReader {
            file,
            path: path.to_path_buf(),
        }))
    }

    async fn create(
        &self,
        path: &Path,
        offset: u64,
        truncate: bool,
    ) -> TransferResult<Box<dyn ChunkWriter>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| local_error("create directory", parent, e))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)
            .await
            .map_err(|e| local_error("create", path, e))?;
        if !truncate {
            // Anything past the resume point was never acknowledged.
            file.set_len(offset)
                .await
                .map_err(|e| local_error("truncate", path, e))?;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| local_error("seek", path, e))?;
        }
        Ok(Box::new(LocalWriter {
            file,
            path: path.to_path_buf(),
        }))
    }

    async fn stat(&self, path: &Path) -> TransferResult<Option<LocalStat>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(LocalStat {
                size: meta.len(),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(local_error("stat", path, e)),
        }
    }

    async fn remove(&self, path: &Path) -> TransferResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(local_error("remove", path, e)),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> TransferResult<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| local_error("create directory", path, e))
    }

    async fn walk_files(&self, root: &Path) -> TransferResult<Vec<PathBuf>> {
        let root = root.to_path_buf();
        let walk_root = root.clone();
        let walked = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for entry in walkdir::WalkDir::new(&walk_root).sort_by_file_name() {
                let entry = entry.map_err(io::Error::from)?;
                if entry.file_type().is_file() {
                    if let Ok(rel) = entry.path().strip_prefix(&walk_root) {
                        files.push(rel.to_path_buf());
                    }
                }
            }
            Ok::<_, io::Error>(files)
        })
        .await
        .map_err(|e| TransferError::local_io(format!("walk {}: {}", root.display(), e)))?;
        walked.map_err(|e| local_error("walk", &root, e))
    }
}

struct LocalReader {
    file: File,
    path: PathBuf,
}

#[async_trait]
impl ChunkReader for LocalReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        self.file
            .read(buf)
            .await
            .map_err(|e| local_error("read", &self.path, e))
    }
}

struct LocalWriter {
    file: File,
    path: PathBuf,
}

#[async_trait]
impl ChunkWriter for LocalWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> TransferResult<()> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| local_error("write", &self.path, e))?;
        // A written chunk counts as durable for resume.
        self.file
            .flush()
            .await
            .map_err(|e| local_error("flush", &self.path, e))
    }

    async fn finish(mut self: Box<Self>) -> TransferResult<()> {
        self.file
            .sync_all()
            .await
            .map_err(|e| local_error("sync", &self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkd_core::{read_full, ErrorKind};

    #[tokio::test]
    async fn write_then_resume_truncates_unacknowledged_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.bin");
        let fs = TokioFilesystem::new();

        let mut w = fs.create(&path, 0, true).await.unwrap();
        w.write_chunk(b"hello world").await.unwrap();
        w.finish().await.unwrap();

        let mut w = fs.create(&path, 5, false).await.unwrap();
        w.write_chunk(b"!").await.unwrap();
        w.finish().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello!");
        assert_eq!(
            fs.stat(&path).await.unwrap(),
            Some(LocalStat {
                size: 6,
                is_dir: false
            })
        );
    }

    #[tokio::test]
    async fn open_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let mut r = TokioFilesystem.open(&path, 4).await.unwrap();
        let mut buf = [0u8; 16];
        let n = read_full(r.as_mut(), &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"456789");
    }

    #[tokio::test]
    async fn missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope");
        let fs = TokioFilesystem;
        assert_eq!(fs.stat(&path).await.unwrap(), None);
        fs.remove(&path).await.unwrap();
        let err = fs.open(&path, 0).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidPath);
        assert_eq!(err.category(), ErrorCategory::Io);
    }

    #[tokio::test]
    async fn walk_lists_relative_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b/c")).unwrap();
        std::fs::write(dir.path().join("b/c/z.txt"), b"z").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b/y.txt"), b"y").unwrap();
        let files = TokioFilesystem.walk_files(dir.path()).await.unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b/c/z.txt"),
                PathBuf::from("b/y.txt"),
            ]
        );
    }
}
