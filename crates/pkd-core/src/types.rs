//! Endpoint, credential, capability and listing types.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;

// ── Protocol ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Ftps,
    Sftp,
    Scp,
    #[serde(rename = "webdav")]
    WebDav,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::Sftp => "sftp",
            Protocol::Scp => "scp",
            Protocol::WebDav => "webdav",
        }
    }

    /// SSH-backed protocols go through host-key verification.
    pub fn is_ssh(self) -> bool {
        matches!(self, Protocol::Sftp | Protocol::Scp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// How FTPS negotiates TLS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum FtpsMode {
    /// Plain connect, then `AUTH TLS` (RFC 4217).
    #[default]
    Explicit,
    /// TLS from the first byte, usually on port 990.
    Implicit,
}

/// What to do with an SSH host key that has no known-hosts record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum HostKeyPolicy {
    #[default]
    Prompt,
    Strict,
    AutoAdd,
}

// ── Endpoint ─────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

/// A remote server plus the protocol options needed to reach it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    /// 0 selects the protocol default.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_true")]
    pub ftp_passive: bool,
    #[serde(default)]
    pub ftps_mode: FtpsMode,
    #[serde(default)]
    pub webdav_base_path: Option<String>,
    #[serde(default = "default_true")]
    pub webdav_tls: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

impl Endpoint {
    pub fn new(protocol: Protocol, host: impl Into<String>) -> Self {
        Self {
            protocol,
            host: host.into(),
            port: 0,
            ftp_passive: true,
            ftps_mode: FtpsMode::default(),
            webdav_base_path: None,
            webdav_tls: true,
            accept_invalid_certs: false,
            host_key_policy: HostKeyPolicy::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn default_port(&self) -> u16 {
        match self.protocol {
            Protocol::Ftp => 21,
            Protocol::Ftps => match self.ftps_mode {
                FtpsMode::Implicit => 990,
                FtpsMode::Explicit => 21,
            },
            Protocol::Sftp | Protocol::Scp => 22,
            Protocol::WebDav => {
                if self.webdav_tls {
                    443
                } else {
                    80
                }
            }
        }
    }

    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.default_port()
        } else {
            self.port
        }
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.effective_port())
    }

    /// Stable identity used for pooling and known-hosts records.
    pub fn key(&self) -> String {
        format!(
            "{}://{}:{}",
            self.protocol.scheme(),
            self.host.to_lowercase(),
            self.effective_port()
        )
    }
}

// ── Authentication material ──────────────────────────────────────────

/// Credentials as handed over by the credential provider. The engine only
/// passes these through to the protocol adapters.
#[derive(Debug, Clone)]
pub enum AuthMaterial {
    Anonymous,
    Password {
        username: String,
        password: SecretString,
    },
    KeyFile {
        username: String,
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
    Agent {
        username: String,
    },
}

impl AuthMaterial {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        AuthMaterial::Password {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            AuthMaterial::Anonymous => None,
            AuthMaterial::Password { username, .. }
            | AuthMaterial::KeyFile { username, .. }
            | AuthMaterial::Agent { username } => Some(username),
        }
    }
}

// ── Capabilities ─────────────────────────────────────────────────────

/// Bit-set of optional session features.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities(u8);

impl Capabilities {
    /// `open_read` honours a non-zero offset.
    pub const RESUME_READ: Capabilities = Capabilities(0b001);
    /// `open_write` honours a non-zero offset.
    pub const RESUME_WRITE: Capabilities = Capabilities(0b010);
    pub const CHECKSUM: Capabilities = Capabilities(0b100);

    pub const fn empty() -> Self {
        Capabilities(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Capabilities) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Capabilities) {
        self.0 &= !other.0;
    }

    /// Whether a transfer in `direction` may start at a non-zero offset.
    pub fn supports_resume(self, direction: Direction) -> bool {
        match direction {
            Direction::Download => self.contains(Capabilities::RESUME_READ),
            Direction::Upload => self.contains(Capabilities::RESUME_WRITE),
        }
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Capabilities::RESUME_READ) {
            names.push("RESUME_READ");
        }
        if self.contains(Capabilities::RESUME_WRITE) {
            names.push("RESUME_WRITE");
        }
        if self.contains(Capabilities::CHECKSUM) {
            names.push("CHECKSUM");
        }
        write!(f, "Capabilities({})", names.join(" | "))
    }
}

// ── Direction / entries ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One directory entry. Fields a protocol cannot report are `None`, never
/// zero-filled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Unix permission bits (e.g. `0o644`).
    pub permissions: Option<u32>,
}

impl Entry {
    pub fn new(name: impl Into<String>, path: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind,
            size: None,
            modified: None,
            permissions: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Join a remote directory and a child name with exactly one `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "/" {
        format!("/{}", name.trim_start_matches('/'))
    } else {
        format!(
            "{}/{}",
            dir.trim_end_matches('/'),
            name.trim_start_matches('/')
        )
    }
}

/// Parent directory and file name of a remote path.
pub fn split_remote(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}
