//! Remote shell commands and their output formats.

use crate::blocking;
use crate::error::{map_remote_io, map_remote_stderr, map_ssh_error};
use chrono::{TimeZone, Utc};
use pkd_core::{join_remote, Entry, EntryKind, TransferError, TransferResult};
use ssh2::Session;
use std::io::Read;

/// Quote a path for a POSIX shell.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Output of one remote command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` on a fresh exec channel and collect its output.
pub async fn exec(session: &Session, command: String) -> TransferResult<CommandOutput> {
    let session = session.clone();
    blocking(move || {
        let mut channel = session
            .channel_session()
            .map_err(|e| map_ssh_error("failed to open channel", &e))?;
        channel
            .exec(&command)
            .map_err(|e| map_ssh_error("failed to start remote command", &e))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| map_remote_io("reading command output", e))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| map_remote_io("reading command errors", e))?;
        channel
            .wait_close()
            .map_err(|e| map_ssh_error("closing channel", &e))?;
        let status = channel
            .exit_status()
            .map_err(|e| map_ssh_error("reading exit status", &e))?;
        log::trace!("remote `{}` exited with {}", command, status);
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    })
    .await
}

/// Like [`exec`], failing on a non-zero exit status.
pub async fn exec_ok(session: &Session, context: &str, command: String) -> TransferResult<String> {
    let out = exec(session, command).await?;
    if out.status != 0 {
        return Err(map_remote_stderr(context, &out.stderr));
    }
    Ok(out.stdout)
}

/// `find` format used for listings: type, size, mtime, mode, name.
pub const FIND_FORMAT: &str = "%y\\t%s\\t%T@\\t%m\\t%f\\n";

/// `stat --printf` format used for single paths: type, size, mtime, mode.
pub const STAT_FORMAT: &str = "%F\\t%s\\t%Y\\t%a\\n";

pub fn list_command(path: &str) -> String {
    format!(
        "find {} -mindepth 1 -maxdepth 1 -printf '{}'",
        shell_escape(path),
        FIND_FORMAT
    )
}

pub fn stat_command(path: &str) -> String {
    format!("stat -L --printf '{}' {}", STAT_FORMAT, shell_escape(path))
}

fn mtime(secs: &str) -> Option<chrono::DateTime<Utc>> {
    let whole = secs.split('.').next()?.parse::<i64>().ok()?;
    Utc.timestamp_opt(whole, 0).single()
}

/// Parse `find -printf` output produced with [`FIND_FORMAT`].
pub fn parse_find_output(dir: &str, output: &str) -> Vec<Entry> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.splitn(5, '\t');
            let kind = match cols.next()? {
                "f" => EntryKind::File,
                "d" => EntryKind::Directory,
                "l" => EntryKind::Symlink,
                _ => EntryKind::Other,
            };
            let size = cols.next()?.parse::<u64>().ok();
            let modified = mtime(cols.next()?);
            let permissions = u32::from_str_radix(cols.next()?, 8).ok();
            let name = cols.next()?;
            if name.is_empty() || name == "." || name == ".." {
                return None;
            }
            let mut entry = Entry::new(name, join_remote(dir, name), kind);
            entry.size = if kind == EntryKind::Directory { None } else { size };
            entry.modified = modified;
            entry.permissions = permissions;
            Some(entry)
        })
        .collect()
}

/// Parse one line of `stat --printf` output produced with [`STAT_FORMAT`].
pub fn parse_stat_output(path: &str, output: &str) -> TransferResult<Entry> {
    let line = output.lines().next().unwrap_or("");
    let cols: Vec<&str> = line.split('\t').collect();
    if cols.len() < 4 {
        return Err(TransferError::protocol(format!(
            "unexpected stat output: {:?}",
            line
        )));
    }
    let kind = match cols[0] {
        "regular file" | "regular empty file" => EntryKind::File,
        "directory" => EntryKind::Directory,
        "symbolic link" => EntryKind::Symlink,
        _ => EntryKind::Other,
    };
    let (_, name) = pkd_core::split_remote(path);
    let mut entry = Entry::new(name, path, kind);
    entry.size = if kind == EntryKind::Directory {
        None
    } else {
        cols[1].parse().ok()
    };
    entry.modified = mtime(cols[2]);
    entry.permissions = u32::from_str_radix(cols[3], 8).ok();
    Ok(entry)
}
