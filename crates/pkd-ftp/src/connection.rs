//! TCP + TLS transport: establishes the FTP control connection.

use crate::protocol::FtpCodec;
use crate::reply::FtpReply;
use crate::tls;
use pkd_core::{TransferError, TransferResult};
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Open a TCP connection, mapping failures onto the connection taxonomy.
pub async fn connect_tcp(addr: &str, limit: Duration) -> TransferResult<TcpStream> {
    let tcp = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| TransferError::timeout(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| classify_connect_error(addr, e))?;
    tcp.set_nodelay(true).ok();
    Ok(tcp)
}

/// Resolver failures surface as `Other`/`Uncategorized` I/O errors whose
/// text names the lookup; everything else keeps its I/O kind.
fn classify_connect_error(addr: &str, e: io::Error) -> TransferError {
    let text = e.to_string();
    let lower = text.to_lowercase();
    if lower.contains("failed to lookup")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
        || lower.contains("nodename nor servname")
    {
        return TransferError::dns(format!("cannot resolve {}: {}", addr, text));
    }
    let mut err = TransferError::from(e);
    err.message = format!("TCP connect to {}: {}", addr, text);
    err
}

/// A freshly opened control connection.
pub struct ControlConnection {
    pub codec: FtpCodec,
    pub banner: FtpReply,
    pub peer: Option<IpAddr>,
    pub local: Option<IpAddr>,
}

/// Establish the control connection and read the server welcome banner.
///
/// With `implicit_tls` the socket is wrapped immediately; explicit FTPS
/// upgrades later via `AUTH TLS` (see `client.rs`).
pub async fn connect(
    host: &str,
    addr: &str,
    limit: Duration,
    implicit_tls: Option<&TlsConnector>,
) -> TransferResult<ControlConnection> {
    let tcp = connect_tcp(addr, limit).await?;
    let peer = tcp.peer_addr().ok().map(|a| a.ip());
    let local = tcp.local_addr().ok().map(|a| a.ip());

    let mut codec = match implicit_tls {
        Some(connector) => {
            let stream = tls::handshake(connector, host, tcp, "Implicit").await?;
            FtpCodec::from_tls(stream, limit)
        }
        None => FtpCodec::from_tcp(tcp, limit),
    };

    let banner = codec.read_reply().await?;
    if !banner.is_completion() {
        return Err(banner.into_error());
    }
    Ok(ControlConnection {
        codec,
        banner,
        peer,
        local,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_errors_become_dns_failures() {
        let e = io::Error::new(
            io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        let err = classify_connect_error("nowhere.invalid:21", e);
        assert_eq!(err.kind, pkd_core::ErrorKind::DnsFailure);
        assert!(!err.is_transient());
    }

    #[test]
    fn refused_is_transient() {
        let e = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = classify_connect_error("127.0.0.1:21", e);
        assert_eq!(err.kind, pkd_core::ErrorKind::ConnectionRefused);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn refused_port_maps_to_connection_error() {
        // Bind then drop to get a port that is very likely closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = connect_tcp(&addr, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(
            err.category(),
            pkd_core::ErrorCategory::Connection,
            "{:?}",
            err
        );
    }
}
