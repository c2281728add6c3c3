//! Stateful FTP client: owns the control connection and issues commands.
//!
//! Lifecycle: `connect()` → optional TLS (implicit or `AUTH TLS`) →
//! authenticate → FEAT probing → `TYPE I`.

use crate::connection;
use crate::parser;
use crate::protocol::FtpCodec;
use crate::reply::FtpReply;
use crate::tls;
use crate::transfer::{self, DataChannelConfig, DataChannelMode, DataStream};
use chrono::{DateTime, Utc};
use pkd_core::{
    AuthMaterial, Endpoint, Entry, EntryKind, ErrorKind, FtpsMode, Protocol, TransferError,
    TransferResult,
};
use secrecy::ExposeSecret;
use std::net::IpAddr;
use std::time::Duration;
use tokio_rustls::TlsConnector;

/// Parsed FEAT reply.
#[derive(Debug, Clone, Default)]
pub struct ServerFeatures {
    pub mlsd: bool,
    pub mlst: bool,
    pub size: bool,
    pub mdtm: bool,
    pub rest_stream: bool,
    pub utf8: bool,
    pub epsv: bool,
    pub raw_features: Vec<String>,
}

impl ServerFeatures {
    pub fn from_feat_reply(reply: &FtpReply) -> Self {
        let raw: Vec<String> = reply
            .lines
            .iter()
            .skip(1) // "211-Features:"
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .collect();

        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        ServerFeatures {
            mlsd: has("MLSD") || has("MLST"),
            mlst: has("MLST"),
            size: has("SIZE"),
            mdtm: has("MDTM"),
            rest_stream: has("REST STREAM"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            raw_features: raw,
        }
    }
}

/// A connected FTP client session.
pub struct FtpClient {
    pub codec: FtpCodec,
    pub features: ServerFeatures,
    host: String,
    passive: bool,
    /// Present for FTPS; reused for every data channel.
    data_tls: Option<TlsConnector>,
    control_peer: Option<IpAddr>,
    control_local: Option<IpAddr>,
    io_timeout: Duration,
    connected: bool,
}

impl FtpClient {
    /// Establish and authenticate a new FTP/FTPS session.
    pub async fn connect(
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        io_timeout: Duration,
    ) -> TransferResult<Self> {
        if endpoint.host.is_empty() {
            return Err(TransferError::invalid_config("host must not be empty"));
        }

        let secure = endpoint.protocol == Protocol::Ftps;
        let connector = if secure {
            Some(tls::build_tls_connector(endpoint.accept_invalid_certs)?)
        } else {
            None
        };
        let implicit = secure && endpoint.ftps_mode == FtpsMode::Implicit;

        let addr = endpoint.address();
        log::info!("Connecting to {} ({})", addr, endpoint.protocol);
        let control = connection::connect(
            &endpoint.host,
            &addr,
            io_timeout,
            if implicit { connector.as_ref() } else { None },
        )
        .await?;
        log::debug!("FTP banner: {}", control.banner.message());
        let mut codec = control.codec;

        // ── Explicit FTPS: AUTH TLS ──────────────────────────────
        if let (Some(connector), false) = (connector.as_ref(), implicit) {
            let reply = codec.execute("AUTH TLS").await?;
            if reply.code != 234 {
                return Err(TransferError::tls(format!(
                    "AUTH TLS rejected: {}",
                    reply.text()
                ))
                .with_code(reply.code as u32));
            }
            codec = tls::upgrade_to_tls(codec, &endpoint.host, connector).await?;
        }
        if secure {
            codec.expect_ok("PBSZ 0").await?;
            codec.expect_ok("PROT P").await?;
        }

        // ── Authenticate ─────────────────────────────────────────
        Self::login(&mut codec, auth).await?;

        // ── FEAT ─────────────────────────────────────────────────
        let features = match codec.execute("FEAT").await {
            Ok(reply) if reply.is_completion() => ServerFeatures::from_feat_reply(&reply),
            _ => ServerFeatures::default(),
        };
        if features.utf8 {
            let _ = codec.execute("OPTS UTF8 ON").await;
        }

        codec.expect_ok("TYPE I").await?;

        Ok(Self {
            codec,
            features,
            host: endpoint.host.clone(),
            passive: endpoint.ftp_passive,
            data_tls: connector,
            control_peer: control.peer,
            control_local: control.local,
            io_timeout,
            connected: true,
        })
    }

    async fn login(codec: &mut FtpCodec, auth: &AuthMaterial) -> TransferResult<()> {
        let (user, pass) = match auth {
            AuthMaterial::Anonymous => ("anonymous".to_string(), "anonymous@".to_string()),
            AuthMaterial::Password { username, password } => {
                (username.clone(), password.expose_secret().clone())
            }
            AuthMaterial::KeyFile { .. } | AuthMaterial::Agent { .. } => {
                return Err(TransferError::new(
                    ErrorKind::InvalidCredentials,
                    "FTP supports only password or anonymous login",
                ))
            }
        };

        let user_reply = codec.execute(&format!("USER {}", user)).await?;
        let final_reply = if user_reply.code == 331 {
            codec.execute(&format!("PASS {}", pass)).await?
        } else {
            user_reply
        };
        if final_reply.is_completion() {
            return Ok(());
        }
        if final_reply.code == 421 {
            return Err(final_reply.into_error());
        }
        Err(TransferError::auth_failed(format!("login failed: {}", final_reply.text()))
            .with_code(final_reply.code as u32))
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    // ─── Data channel helper ─────────────────────────────────────

    /// Open a data connection for `cmd` (RETR/STOR/LIST/MLSD), optionally
    /// restarting at `rest`. Returns once the server accepted the command.
    pub async fn open_transfer(&mut self, cmd: &str, rest: u64) -> TransferResult<DataStream> {
        let mode = match (self.passive, self.features.epsv) {
            (true, true) => DataChannelMode::ExtendedPassive,
            (true, false) => DataChannelMode::Passive,
            (false, true) => DataChannelMode::ExtendedActive,
            (false, false) => DataChannelMode::Active,
        };
        let cfg = DataChannelConfig {
            mode,
            host: &self.host,
            control_peer: self.control_peer,
            control_local: self.control_local,
            tls: self.data_tls.as_ref(),
            timeout: self.io_timeout,
        };
        let pending = transfer::prepare_data_channel(&mut self.codec, &cfg).await?;

        if rest > 0 {
            let reply = self.codec.execute(&format!("REST {}", rest)).await?;
            if reply.code != 350 {
                let err = reply.into_error();
                return Err(match err.kind {
                    ErrorKind::ProtocolViolation | ErrorKind::Unsupported => {
                        TransferError::unsupported(format!("REST rejected: {}", err.message))
                    }
                    _ => err,
                });
            }
        }

        let reply = self.codec.execute(cmd).await?;
        if !reply.is_preliminary() {
            return Err(reply.into_error());
        }
        transfer::complete_data_channel(pending, &cfg).await
    }

    /// Read the completion reply after the data channel closed.
    pub async fn finish_transfer(&mut self) -> TransferResult<()> {
        let done = self.codec.read_reply().await?;
        if done.is_completion() {
            return Ok(());
        }
        Err(done.into_error())
    }

    // ─── Listing ─────────────────────────────────────────────────

    /// Directory listing (prefers MLSD, falls back to LIST).
    pub async fn list(&mut self, path: &str) -> TransferResult<Vec<Entry>> {
        let cmd = if self.features.mlsd {
            format!("MLSD {}", path)
        } else {
            format!("LIST -a {}", path)
        };
        let mut ds = self.open_transfer(&cmd, 0).await?;
        let body = ds.read_to_end(self.io_timeout).await?;
        drop(ds);
        self.finish_transfer().await?;
        let text = String::from_utf8_lossy(&body);
        Ok(parser::parse_listing(&text, path))
    }

    // ─── Metadata ────────────────────────────────────────────────

    /// MLST where available, otherwise SIZE + MDTM with a CWD probe for
    /// directories.
    pub async fn stat(&mut self, path: &str) -> TransferResult<Entry> {
        if self.features.mlst {
            let reply = self.codec.expect_ok(&format!("MLST {}", path)).await?;
            // 250-Listing /path
            //  type=file;size=42; /path
            // 250 End
            if let Some(line) = reply
                .lines
                .iter()
                .find(|l| l.starts_with(' ') && l.contains('='))
            {
                if let Some(mut entry) = parser::parse_mlsd(line.trim_start(), "") {
                    entry.path = path.to_string();
                    return Ok(entry);
                }
            }
        }

        let (_, name) = pkd_core::split_remote(path);
        match self.size(path).await {
            Ok(size) => {
                let mut entry = Entry::new(name, path, EntryKind::File);
                entry.size = Some(size);
                if self.features.mdtm {
                    entry.modified = self.mdtm(path).await.ok();
                }
                Ok(entry)
            }
            Err(e) if e.kind == ErrorKind::NotFound || e.kind == ErrorKind::Unsupported => {
                // SIZE fails on directories; probe with CWD and go back.
                let pwd = self.pwd().await.unwrap_or_else(|_| "/".to_string());
                if self.codec.expect_ok(&format!("CWD {}", path)).await.is_ok() {
                    let _ = self.codec.execute(&format!("CWD {}", pwd)).await;
                    return Ok(Entry::new(name, path, EntryKind::Directory));
                }
                Err(TransferError::not_found(format!("{} does not exist", path)))
            }
            Err(e) => Err(e),
        }
    }

    /// Size of a remote file (RFC 3659 SIZE).
    pub async fn size(&mut self, path: &str) -> TransferResult<u64> {
        let reply = self.codec.expect_ok(&format!("SIZE {}", path)).await?;
        reply
            .message()
            .trim()
            .parse::<u64>()
            .map_err(|_| TransferError::protocol(format!("cannot parse SIZE reply: {}", reply.text())))
    }

    /// Modification time of a remote file (RFC 3659 MDTM).
    pub async fn mdtm(&mut self, path: &str) -> TransferResult<DateTime<Utc>> {
        let reply = self.codec.expect_ok(&format!("MDTM {}", path)).await?;
        parser::parse_mlsd_time(reply.message().trim())
            .ok_or_else(|| TransferError::protocol(format!("cannot parse MDTM reply: {}", reply.text())))
    }

    pub async fn pwd(&mut self) -> TransferResult<String> {
        let reply = self.codec.expect_ok("PWD").await?;
        parse_pwd(&reply.text())
    }

    // ─── Keepalive / QUIT ───────────────────────────────────────

    pub async fn noop(&mut self) -> TransferResult<()> {
        self.codec.expect_ok("NOOP").await.map(|_| ())
    }

    /// Gracefully close the session.
    pub async fn quit(&mut self) -> TransferResult<()> {
        if self.connected {
            self.connected = false;
            let _ = self.codec.execute("QUIT").await;
        }
        Ok(())
    }
}

/// Parse `257 "/some/path"` into the path string.
fn parse_pwd(text: &str) -> TransferResult<String> {
    if let Some(start) = text.find('"') {
        if let Some(end) = text[start + 1..].find('"') {
            return Ok(text[start + 1..start + 1 + end].to_string());
        }
    }
    Err(TransferError::protocol(format!("cannot parse PWD reply: {}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feat_parsing() {
        let reply = FtpReply {
            code: 211,
            lines: vec![
                "211-Features:".into(),
                " MDTM".into(),
                " REST STREAM".into(),
                " SIZE".into(),
                " MLST type*;size*;modify*;".into(),
                " EPSV".into(),
                "211 End".into(),
            ],
        };
        let f = ServerFeatures::from_feat_reply(&reply);
        assert!(f.mdtm && f.size && f.rest_stream && f.mlst && f.mlsd && f.epsv);
        assert!(!f.utf8);
    }

    #[test]
    fn pwd_parsing() {
        assert_eq!(parse_pwd("257 \"/home/me\" is current").unwrap(), "/home/me");
        assert!(parse_pwd("257 nothing").is_err());
    }
}
