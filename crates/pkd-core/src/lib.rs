//! # pkd-core
//!
//! Protocol-neutral building blocks shared by every crate of the transfer
//! engine:
//!
//! - **types**: `Protocol`, `Endpoint`, `AuthMaterial`, `Capabilities`,
//!   directory `Entry` values
//! - **error**: the `TransferError` taxonomy every adapter maps into
//! - **session**: the `ProtocolSession` contract plus chunked reader/writer
//!   traits and the `SessionFactory` seam
//! - **providers**: collaborator traits (credentials, configuration,
//!   host-key prompt, local filesystem)
//! - **config**: `EngineConfig` and its defaults
//! - **host_keys**: known-hosts store and fingerprint verification

pub mod config;
pub mod error;
pub mod host_keys;
pub mod providers;
pub mod session;
pub mod types;

pub use config::EngineConfig;
pub use error::{ErrorCategory, ErrorKind, TransferError, TransferResult};
pub use host_keys::{format_fingerprint, verify_host_key, KnownHosts, MemoryKnownHosts};
pub use providers::{
    ConfigProvider, CredentialProvider, HostKeyDecision, HostKeyPrompt, LocalFilesystem,
    LocalStat, RejectUnknownHosts, StaticConfigProvider, StaticCredentials,
};
pub use session::{
    read_full, ChunkReader, ChunkWriter, ConnectContext, ProtocolSession, SessionFactory,
};
pub use types::{
    join_remote, split_remote, AuthMaterial, Capabilities, Direction, Endpoint, Entry, EntryKind,
    FtpsMode, HostKeyPolicy, Protocol,
};
