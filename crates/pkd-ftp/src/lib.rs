//! # pkd-ftp: FTP / FTPS protocol session
//!
//! RFC 959 with the extensions a transfer engine needs:
//! - **RFC 2228 / 4217**: AUTH TLS / FTPS (Explicit & Implicit), `PROT P`
//!   data channels
//! - **RFC 3659**: MLSD/MLST, SIZE, MDTM, REST STREAM
//! - **RFC 2389**: FEAT negotiation
//! - **RFC 2428**: EPSV / EPRT
//!
//! Architecture:
//! - `reply`: reply type and reply-code → `TransferError` classification
//! - `protocol`: low-level command/response codec
//! - `tls`: rustls connector construction and control-channel upgrade
//! - `connection`: TCP + implicit TLS transport
//! - `transfer`: data channel management (PASV/EPSV/PORT/EPRT)
//! - `parser`: Unix/Windows/MLSD listing parser
//! - `client`: stateful FTP client (login, FEAT, SIZE/MDTM, ...)
//! - `session`: the `ProtocolSession` implementation

pub mod client;
pub mod connection;
pub mod parser;
pub mod protocol;
pub mod reply;
pub mod session;
pub mod tls;
pub mod transfer;

pub use client::{FtpClient, ServerFeatures};
pub use reply::{classify_reply, FtpReply};
pub use session::FtpSession;
