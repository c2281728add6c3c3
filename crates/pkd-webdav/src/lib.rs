//! # pkd-webdav
//!
//! WebDAV (RFC 4918) protocol session:
//!
//! - **client**: `reqwest`-based HTTP client (PROPFIND, ranged GET,
//!   streamed PUT, sabre/dav partial PATCH, MKCOL, DELETE, MOVE)
//! - **xml**: multistatus parsing and href → path mapping
//! - **session**: the `ProtocolSession` implementation

pub mod client;
pub mod session;
pub mod xml;

pub use client::{DavClient, ServerFeatures};
pub use session::WebDavSession;
