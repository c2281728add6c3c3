//! Data-channel management for FTP transfers.
//!
//! Supports four modes (RFC 959 + RFC 2428):
//! - **PASV**: server opens a port, client connects
//! - **EPSV**: extended passive (IPv6-ready)
//! - **PORT**: client opens a port, tells server
//! - **EPRT**: extended active (IPv6-ready)
//!
//! The data socket is TLS-wrapped for FTPS (PROT P).

use crate::protocol::FtpCodec;
use crate::tls;
use lazy_static::lazy_static;
use pkd_core::{TransferError, TransferResult};
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

lazy_static! {
    static ref PASV_RE: Option<Regex> =
        Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").ok();
    static ref EPSV_RE: Option<Regex> = Regex::new(r"\|\|\|(\d+)\|").ok();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelMode {
    Passive,
    ExtendedPassive,
    Active,
    ExtendedActive,
}

/// Abstraction over a plain or TLS-wrapped data stream.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl DataStream {
    pub async fn read(&mut self, buf: &mut [u8], limit: Duration) -> TransferResult<usize> {
        let read = async {
            match self {
                DataStream::Plain(s) => s.read(buf).await,
                DataStream::Tls(s) => s.read(buf).await,
            }
        };
        match timeout(limit, read).await {
            Ok(Ok(n)) => Ok(n),
            // Servers that drop the TCP connection without close_notify
            // after a complete transfer; the 226 reply decides.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransferError::timeout("data channel read timed out")),
        }
    }

    pub async fn write_all(&mut self, data: &[u8], limit: Duration) -> TransferResult<()> {
        let write = async {
            match self {
                DataStream::Plain(s) => s.write_all(data).await,
                DataStream::Tls(s) => s.write_all(data).await,
            }
        };
        timeout(limit, write)
            .await
            .map_err(|_| TransferError::timeout("data channel write timed out"))?
            .map_err(TransferError::from)
    }

    /// Flush and close the write side (sends TLS close_notify).
    pub async fn shutdown(&mut self) -> TransferResult<()> {
        match self {
            DataStream::Plain(s) => s.shutdown().await?,
            DataStream::Tls(s) => s.shutdown().await?,
        }
        Ok(())
    }

    pub async fn read_to_end(&mut self, limit: Duration) -> TransferResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = self.read(&mut buf, limit).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }
}

/// Everything needed to open and secure a data channel.
pub struct DataChannelConfig<'a> {
    pub mode: DataChannelMode,
    pub host: &'a str,
    /// Address of the control connection's peer, used when a PASV reply
    /// advertises an unroutable address.
    pub control_peer: Option<IpAddr>,
    /// Local address of the control connection; active modes listen there.
    pub control_local: Option<IpAddr>,
    pub tls: Option<&'a TlsConnector>,
    pub timeout: Duration,
}

/// A data connection negotiated but not yet usable: passive modes are
/// already connected, active modes wait for the server to dial in once the
/// transfer command has been sent.
pub enum PendingData {
    Connected(TcpStream),
    Listening(TcpListener),
}

/// Negotiate the data connection (PASV/EPSV/PORT/EPRT). Call before the
/// transfer command.
pub async fn prepare_data_channel(
    codec: &mut FtpCodec,
    cfg: &DataChannelConfig<'_>,
) -> TransferResult<PendingData> {
    Ok(match cfg.mode {
        DataChannelMode::Passive => {
            PendingData::Connected(open_pasv(codec, cfg.control_peer, cfg.timeout).await?)
        }
        DataChannelMode::ExtendedPassive => {
            PendingData::Connected(open_epsv(codec, cfg.host, cfg.timeout).await?)
        }
        DataChannelMode::Active => {
            PendingData::Listening(open_port(codec, cfg.control_local).await?)
        }
        DataChannelMode::ExtendedActive => {
            PendingData::Listening(open_eprt(codec, cfg.control_local).await?)
        }
    })
}

/// Finish the data connection after the server's 1xx reply: accept the
/// active-mode connection and wrap it in TLS for FTPS.
pub async fn complete_data_channel(
    pending: PendingData,
    cfg: &DataChannelConfig<'_>,
) -> TransferResult<DataStream> {
    let tcp = match pending {
        PendingData::Connected(tcp) => tcp,
        PendingData::Listening(listener) => accept_data(listener, cfg.timeout).await?,
    };

    match cfg.tls {
        Some(connector) => {
            let stream = tls::handshake(connector, cfg.host, tcp, "Data channel").await?;
            Ok(DataStream::Tls(Box::new(stream)))
        }
        None => Ok(DataStream::Plain(tcp)),
    }
}

async fn connect_data(addr: String, limit: Duration, what: &str) -> TransferResult<TcpStream> {
    timeout(limit, TcpStream::connect(&addr))
        .await
        .map_err(|_| TransferError::timeout(format!("{} data connect to {} timed out", what, addr)))?
        .map_err(|e| {
            let mut err = TransferError::from(e);
            err.message = format!("{} data connect to {}: {}", what, addr, err.message);
            err
        })
}

// ─── PASV ────────────────────────────────────────────────────────────

/// Issue `PASV`, parse the reply, connect to the returned address.
///
/// Reply format: `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
async fn open_pasv(
    codec: &mut FtpCodec,
    control_peer: Option<IpAddr>,
    limit: Duration,
) -> TransferResult<TcpStream> {
    let reply = codec.expect_ok("PASV").await?;
    let mut addr = parse_pasv_reply(&reply.text())?;
    if let Some(peer) = control_peer {
        if addr.ip().is_unspecified() || (is_private(addr.ip()) && !is_private(peer)) {
            log::debug!("PASV advertised {}, using control peer {}", addr.ip(), peer);
            addr.set_ip(peer);
        }
    }
    connect_data(addr.to_string(), limit, "PASV").await
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Parse `(h1,h2,h3,h4,p1,p2)` from a 227 reply.
pub fn parse_pasv_reply(text: &str) -> TransferResult<SocketAddr> {
    let caps = PASV_RE
        .as_ref()
        .and_then(|re| re.captures(text))
        .ok_or_else(|| TransferError::protocol(format!("cannot parse PASV reply: {}", text)))?;

    let nums: Vec<u8> = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| TransferError::protocol("PASV number out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok(SocketAddr::new(ip, port))
}

// ─── EPSV ────────────────────────────────────────────────────────────

/// Issue `EPSV`, parse port, connect to the *same host* on that port.
///
/// Reply format: `229 Entering Extended Passive Mode (|||port|)`
async fn open_epsv(codec: &mut FtpCodec, host: &str, limit: Duration) -> TransferResult<TcpStream> {
    let reply = codec.expect_ok("EPSV").await?;
    let port = parse_epsv_reply(&reply.text())?;
    let addr = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    connect_data(addr, limit, "EPSV").await
}

pub fn parse_epsv_reply(text: &str) -> TransferResult<u16> {
    let caps = EPSV_RE
        .as_ref()
        .and_then(|re| re.captures(text))
        .ok_or_else(|| TransferError::protocol(format!("cannot parse EPSV reply: {}", text)))?;
    caps[1]
        .parse::<u16>()
        .map_err(|_| TransferError::protocol("EPSV port out of range"))
}

// ─── PORT / EPRT ─────────────────────────────────────────────────────

async fn bind_active(local: Option<IpAddr>) -> TransferResult<TcpListener> {
    let local_ip = local.ok_or_else(|| {
        TransferError::unsupported("active mode needs the control connection's local address")
    })?;
    TcpListener::bind(SocketAddr::new(local_ip, 0))
        .await
        .map_err(|e| TransferError::local_io(format!("active-mode bind: {}", e)))
}

async fn accept_data(listener: TcpListener, limit: Duration) -> TransferResult<TcpStream> {
    let (tcp, _) = timeout(limit, listener.accept())
        .await
        .map_err(|_| TransferError::timeout("active-mode accept timed out"))?
        .map_err(TransferError::from)?;
    Ok(tcp)
}

/// Bind a local listener and announce it via `PORT`.
async fn open_port(codec: &mut FtpCodec, local: Option<IpAddr>) -> TransferResult<TcpListener> {
    let listener = bind_active(local).await?;
    let local = listener.local_addr()?;
    let ip = match local.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Err(TransferError::unsupported("PORT requires IPv4")),
    };
    let o = ip.octets();
    let cmd = format!(
        "PORT {},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        local.port() / 256,
        local.port() % 256
    );
    codec.expect_ok(&cmd).await?;
    Ok(listener)
}

/// Bind a local listener and announce it via `EPRT |af|ip|port|`.
async fn open_eprt(codec: &mut FtpCodec, local: Option<IpAddr>) -> TransferResult<TcpListener> {
    let listener = bind_active(local).await?;
    let local = listener.local_addr()?;
    let af = match local.ip() {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    };
    codec
        .expect_ok(&format!("EPRT |{}|{}|{}|", af, local.ip(), local.port()))
        .await?;
    Ok(listener)
}
