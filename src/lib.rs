//! # portkeydrop
//!
//! Multi-protocol transfer engine for an accessible file-transfer client.
//!
//! This crate wires the protocol adapters into the engine:
//!
//! - [`DefaultSessionFactory`] opens SFTP, SCP, FTP, FTPS and WebDAV
//!   sessions from an [`Endpoint`]
//! - [`logging`] sets up the `tracing` subscriber (with the `log` bridge so
//!   adapter output lands in the same sink)
//!
//! ```no_run
//! # async fn demo() -> pkd_core::TransferResult<()> {
//! use portkeydrop::{start_engine, StaticCredentials, TransferRequest};
//! use pkd_core::{AuthMaterial, Endpoint, Protocol};
//! use std::sync::Arc;
//!
//! let sites = StaticCredentials::new().with_site(
//!     "home",
//!     Endpoint::new(Protocol::Sftp, "nas.local"),
//!     AuthMaterial::password("me", "secret"),
//! );
//! let queue = start_engine(Arc::new(sites));
//! let id = queue.enqueue(TransferRequest::download("home", "/photos/a.jpg", "a.jpg"))?;
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

pub mod logging;

use async_trait::async_trait;
use pkd_core::{
    AuthMaterial, ConnectContext, Endpoint, Protocol, ProtocolSession, SessionFactory,
    TransferResult,
};
use std::sync::Arc;

pub use pkd_core::{
    CredentialProvider, EngineConfig, ErrorCategory, ErrorKind, StaticConfigProvider,
    StaticCredentials, TransferError,
};
pub use pkd_engine::{
    EngineDeps, EventKind, EventStream, JobId, JobSnapshot, JobState, TransferEvent,
    TransferQueue, TransferRequest,
};

/// Opens a session with the adapter matching the endpoint's protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSessionFactory;

#[async_trait]
impl SessionFactory for DefaultSessionFactory {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        ctx: &ConnectContext,
    ) -> TransferResult<Box<dyn ProtocolSession>> {
        log::debug!("Connecting to {} over {:?}", endpoint.key(), endpoint.protocol);
        let session: Box<dyn ProtocolSession> = match endpoint.protocol {
            Protocol::Ftp | Protocol::Ftps => {
                Box::new(pkd_ftp::FtpSession::connect(endpoint, auth, ctx).await?)
            }
            Protocol::Sftp => Box::new(pkd_ssh::SftpSession::connect(endpoint, auth, ctx).await?),
            Protocol::Scp => Box::new(pkd_ssh::ScpSession::connect(endpoint, auth, ctx).await?),
            Protocol::WebDav => {
                Box::new(pkd_webdav::WebDavSession::connect(endpoint, auth, ctx).await?)
            }
        };
        Ok(session)
    }
}

/// Start an engine over the real adapters with default settings.
pub fn start_engine(credentials: Arc<dyn CredentialProvider>) -> TransferQueue {
    TransferQueue::start(EngineDeps::new(Arc::new(DefaultSessionFactory), credentials))
}
