//! # pkd-ssh
//!
//! SSH-backed protocol sessions built on libssh2 (`ssh2`):
//!
//! - **connection**: TCP connect, handshake, host-key verification and
//!   authentication (agent, key file, password, keyboard-interactive)
//! - **sftp**: `ProtocolSession` over the SFTP subsystem, resumable in
//!   both directions
//! - **scp**: `ProtocolSession` over SCP plus remote shell commands for
//!   metadata operations
//! - **error**: libssh2 / SFTP status codes mapped onto `TransferError`
//!
//! libssh2 is blocking; every call runs on the blocking thread pool.

pub mod connection;
pub mod error;
pub mod remote;
pub mod scp;
pub mod sftp;

pub use connection::SshConnection;
pub use scp::ScpSession;
pub use sftp::SftpSession;

use pkd_core::{TransferError, TransferResult};

/// Run a libssh2 call on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> TransferResult<T>
where
    F: FnOnce() -> TransferResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransferError::local_io(format!("SSH worker task failed: {}", e)))?
}
