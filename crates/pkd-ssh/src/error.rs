//! libssh2 and SFTP status codes → protocol-neutral errors.

use pkd_core::{ErrorKind, TransferError};
use ssh2::ErrorCode;
use std::io;

// libssh2 session error codes (libssh2.h).
const LIBSSH2_ERROR_BANNER_RECV: i32 = -2;
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_KEX_FAILURE: i32 = -5;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_CHANNEL_CLOSED: i32 = -26;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

// SFTP status codes (draft-ietf-secsh-filexfer).
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_NO_CONNECTION: i32 = 6;
const SSH_FX_CONNECTION_LOST: i32 = 7;
const SSH_FX_OP_UNSUPPORTED: i32 = 8;
const SSH_FX_NO_SUCH_PATH: i32 = 10;
const SSH_FX_WRITE_PROTECT: i32 = 12;
const SSH_FX_NO_SPACE_ON_FILESYSTEM: i32 = 14;
const SSH_FX_QUOTA_EXCEEDED: i32 = 15;

pub fn map_ssh_error(context: &str, e: &ssh2::Error) -> TransferError {
    let message = format!("{}: {}", context, e.message());
    match e.code() {
        ErrorCode::Session(code) => {
            let kind = match code {
                LIBSSH2_ERROR_TIMEOUT | LIBSSH2_ERROR_SOCKET_TIMEOUT => ErrorKind::Timeout,
                LIBSSH2_ERROR_SOCKET_SEND
                | LIBSSH2_ERROR_SOCKET_RECV
                | LIBSSH2_ERROR_SOCKET_DISCONNECT
                | LIBSSH2_ERROR_CHANNEL_CLOSED
                | LIBSSH2_ERROR_BANNER_RECV => ErrorKind::ConnectionReset,
                LIBSSH2_ERROR_KEX_FAILURE => ErrorKind::ProtocolViolation,
                LIBSSH2_ERROR_AUTHENTICATION_FAILED => ErrorKind::InvalidCredentials,
                LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED | LIBSSH2_ERROR_FILE => ErrorKind::KeyRejected,
                _ => ErrorKind::ProtocolViolation,
            };
            TransferError::new(kind, message)
        }
        ErrorCode::SFTP(code) => {
            let kind = match code {
                SSH_FX_NO_SUCH_FILE | SSH_FX_NO_SUCH_PATH => ErrorKind::NotFound,
                SSH_FX_PERMISSION_DENIED | SSH_FX_WRITE_PROTECT => ErrorKind::PermissionDenied,
                SSH_FX_NO_SPACE_ON_FILESYSTEM | SSH_FX_QUOTA_EXCEEDED => ErrorKind::QuotaExceeded,
                SSH_FX_OP_UNSUPPORTED => ErrorKind::Unsupported,
                SSH_FX_NO_CONNECTION | SSH_FX_CONNECTION_LOST => ErrorKind::ConnectionReset,
                _ => ErrorKind::ProtocolViolation,
            };
            TransferError::new(kind, message).with_code(code as u32)
        }
    }
}

/// I/O errors from remote files and channels. libssh2 wraps its own error
/// inside; anything else is a transport failure, never a local one.
pub fn map_remote_io(context: &str, e: io::Error) -> TransferError {
    if let Some(inner) = e.get_ref().and_then(|i| i.downcast_ref::<ssh2::Error>()) {
        return map_ssh_error(context, inner);
    }
    let message = format!("{}: {}", context, e);
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransferError::timeout(message),
        _ => TransferError::connection_reset(message),
    }
}

/// Classify the stderr of a failed remote shell command.
pub fn map_remote_stderr(context: &str, stderr: &str) -> TransferError {
    let lower = stderr.to_lowercase();
    let message = format!("{}: {}", context, stderr.trim());
    if lower.contains("no such file") || lower.contains("not found") {
        TransferError::not_found(message)
    } else if lower.contains("permission denied") || lower.contains("read-only file system") {
        TransferError::permission_denied(message)
    } else if lower.contains("no space left") || lower.contains("quota") {
        TransferError::quota_exceeded(message)
    } else {
        TransferError::protocol(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkd_core::ErrorCategory;

    #[test]
    fn session_codes_map_to_taxonomy() {
        let e = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT), "timed out");
        let err = map_ssh_error("read", &e);
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.is_transient());

        let e = ssh2::Error::new(
            ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED),
            "auth",
        );
        assert_eq!(map_ssh_error("auth", &e).category(), ErrorCategory::Auth);

        let e = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV), "recv");
        assert_eq!(map_ssh_error("read", &e).kind, ErrorKind::ConnectionReset);
    }

    #[test]
    fn sftp_codes_map_to_taxonomy() {
        let e = ssh2::Error::new(ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE), "no such file");
        let err = map_ssh_error("stat", &e);
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.code, Some(2));

        let e = ssh2::Error::new(ErrorCode::SFTP(SSH_FX_NO_SPACE_ON_FILESYSTEM), "full");
        let err = map_ssh_error("write", &e);
        assert_eq!(err.kind, ErrorKind::QuotaExceeded);
        assert!(!err.is_transient());
    }

    #[test]
    fn wrapped_io_errors_keep_the_ssh_code() {
        let inner = ssh2::Error::new(ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED), "denied");
        let io_err = io::Error::new(io::ErrorKind::Other, inner);
        assert_eq!(
            map_remote_io("read", io_err).kind,
            ErrorKind::PermissionDenied
        );

        let plain = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(map_remote_io("write", plain).kind, ErrorKind::ConnectionReset);
    }

    #[test]
    fn stderr_classification() {
        assert_eq!(
            map_remote_stderr("rm", "rm: cannot remove 'x': No such file or directory").kind,
            ErrorKind::NotFound
        );
        assert_eq!(
            map_remote_stderr("cat", "sh: /etc/x: Permission denied").kind,
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            map_remote_stderr("cat", "cat: write error: No space left on device").kind,
            ErrorKind::QuotaExceeded
        );
        assert_eq!(
            map_remote_stderr("mv", "mv: weird").kind,
            ErrorKind::ProtocolViolation
        );
    }
}
