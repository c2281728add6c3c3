//! Protocol-neutral error taxonomy.
//!
//! Every adapter maps its native failures (FTP reply codes, libssh2 error
//! codes, HTTP statuses, `std::io::Error`) into a [`TransferError`]. The
//! engine only ever looks at [`ErrorKind`], its [`ErrorCategory`] and
//! [`ErrorKind::is_transient`].

use serde::{Deserialize, Serialize};
use std::io;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Connection,
    Auth,
    Protocol,
    Io,
    Integrity,
    Cancelled,
    /// Invalid job or configuration handed to the engine.
    Contract,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Connection
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    DnsFailure,
    TlsHandshake,
    HostKeyMismatch,
    /// Server answered but is temporarily unable to serve (FTP 421/450,
    /// HTTP 503, too many connections).
    ServerBusy,
    // Auth
    InvalidCredentials,
    KeyRejected,
    // Protocol
    NotFound,
    PermissionDenied,
    QuotaExceeded,
    Unsupported,
    /// Malformed or unexpected reply from the server.
    ProtocolViolation,
    // Local I/O
    DiskFull,
    LocalPermissionDenied,
    InvalidPath,
    LocalIo,
    // Integrity
    ResumeMismatch,
    SizeMismatch,
    // Other
    Cancelled,
    InvalidJob,
    InvalidConfig,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        use ErrorKind::*;
        match self {
            Timeout | ConnectionReset | ConnectionRefused | DnsFailure | TlsHandshake
            | HostKeyMismatch | ServerBusy => ErrorCategory::Connection,
            InvalidCredentials | KeyRejected => ErrorCategory::Auth,
            NotFound | PermissionDenied | QuotaExceeded | Unsupported | ProtocolViolation => {
                ErrorCategory::Protocol
            }
            DiskFull | LocalPermissionDenied | InvalidPath | LocalIo => ErrorCategory::Io,
            ResumeMismatch | SizeMismatch => ErrorCategory::Integrity,
            Cancelled => ErrorCategory::Cancelled,
            InvalidJob | InvalidConfig => ErrorCategory::Contract,
        }
    }

    /// Failures worth another attempt after a backoff delay.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::ServerBusy
        )
    }
}

/// Categorised transfer error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("[{kind:?}] {message}")]
pub struct TransferError {
    pub kind: ErrorKind,
    pub message: String,
    /// Protocol status code that triggered the error (FTP reply, HTTP
    /// status, SFTP status), if any.
    pub code: Option<u32>,
}

pub type TransferResult<T> = Result<T, TransferError>;

// ── Construction helpers ─────────────────────────────────────────────

impl TransferError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn connection_reset(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionReset, msg)
    }

    pub fn connection_refused(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionRefused, msg)
    }

    pub fn dns(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::DnsFailure, msg)
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TlsHandshake, msg)
    }

    pub fn host_key_mismatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostKeyMismatch, msg)
    }

    pub fn server_busy(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerBusy, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCredentials, msg)
    }

    pub fn key_rejected(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::KeyRejected, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, msg)
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, msg)
    }

    pub fn local_io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::LocalIo, msg)
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPath, msg)
    }

    pub fn size_mismatch(expected: u64, actual: u64) -> Self {
        Self::new(
            ErrorKind::SizeMismatch,
            format!(
                "destination holds {} bytes, source has {}",
                actual, expected
            ),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "transfer cancelled")
    }

    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidJob, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, msg)
    }
}

/// ENOSPC on Unix, ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL on Windows.
#[cfg(windows)]
fn is_disk_full(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(39) | Some(112))
}

#[cfg(not(windows))]
fn is_disk_full(e: &io::Error) -> bool {
    e.raw_os_error() == Some(28)
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        if is_disk_full(&e) {
            return Self::new(ErrorKind::DiskFull, e.to_string());
        }
        let kind = match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::PermissionDenied => ErrorKind::LocalPermissionDenied,
            io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => ErrorKind::InvalidPath,
            _ => ErrorKind::LocalIo,
        };
        Self::new(kind, e.to_string())
    }
}
