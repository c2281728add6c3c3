//! SSH transport: TCP, handshake, host-key check, authentication.

use crate::blocking;
use crate::error::map_ssh_error;
use pkd_core::{
    format_fingerprint, verify_host_key, AuthMaterial, ConnectContext, Endpoint, TransferError,
    TransferResult,
};
use secrecy::ExposeSecret;
use ssh2::{HashType, Session};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// An authenticated libssh2 session. Cloning shares the same connection.
#[derive(Clone)]
pub struct SshConnection {
    session: Session,
    fingerprint: String,
    auth_method: &'static str,
}

impl SshConnection {
    pub async fn connect(
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        ctx: &ConnectContext,
    ) -> TransferResult<Self> {
        let addr = endpoint.address();
        log::info!("SSH connecting to {}", addr);

        let limit = ctx.timeout;
        let keepalive = ctx.keepalive;
        let session = blocking(move || handshake(&addr, limit, keepalive)).await?;

        let fingerprint = session
            .host_key_hash(HashType::Sha256)
            .map(format_fingerprint)
            .ok_or_else(|| TransferError::protocol("server presented no host key"))?;
        verify_host_key(
            endpoint,
            &fingerprint,
            ctx.known_hosts.as_ref(),
            ctx.host_key_prompt.as_ref(),
        )
        .await?;

        let auth = auth.clone();
        let authed = session.clone();
        let auth_method = blocking(move || authenticate(&authed, &auth)).await?;
        log::info!(
            "SSH authenticated to {} via {} (host key {})",
            endpoint.key(),
            auth_method,
            fingerprint
        );

        Ok(Self {
            session,
            fingerprint,
            auth_method,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn auth_method(&self) -> &'static str {
        self.auth_method
    }

    pub async fn keepalive(&self) -> TransferResult<()> {
        let session = self.session.clone();
        blocking(move || {
            session
                .keepalive_send()
                .map(|_| ())
                .map_err(|e| map_ssh_error("keepalive", &e))
        })
        .await
    }

    pub async fn disconnect(&self) -> TransferResult<()> {
        let session = self.session.clone();
        blocking(move || {
            session
                .disconnect(None, "Client disconnecting", None)
                .map_err(|e| map_ssh_error("disconnect", &e))
        })
        .await
    }
}

fn resolve(addr: &str) -> TransferResult<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| TransferError::dns(format!("cannot resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| TransferError::dns(format!("{} resolved to no addresses", addr)))
}

fn handshake(addr: &str, limit: Duration, keepalive: Duration) -> TransferResult<Session> {
    let socket = resolve(addr)?;
    let tcp = TcpStream::connect_timeout(&socket, limit).map_err(|e| {
        let mut err = TransferError::from(e);
        err.message = format!("TCP connect to {}: {}", addr, err.message);
        err
    })?;
    tcp.set_nodelay(true).ok();

    let mut session =
        Session::new().map_err(|e| map_ssh_error("failed to create SSH session", &e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(limit.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .map_err(|e| map_ssh_error("SSH handshake failed", &e))?;
    let secs = keepalive.as_secs().min(u32::MAX as u64) as u32;
    session.set_keepalive(secs > 0, secs);
    Ok(session)
}

// ─── Authentication ──────────────────────────────────────────────────

struct PasswordPrompt<'a> {
    password: &'a str,
}

impl ssh2::KeyboardInteractivePrompt for PasswordPrompt<'_> {
    fn prompt(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.to_string()).collect()
    }
}

fn default_identities() -> Vec<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".ssh"))
        .map(|dir| {
            ["id_ed25519", "id_ecdsa", "id_rsa"]
                .iter()
                .map(|name| dir.join(name))
                .filter(|p| p.exists())
                .collect()
        })
        .unwrap_or_default()
}

fn try_agent(session: &Session, username: &str) -> bool {
    let Ok(mut agent) = session.agent() else {
        return false;
    };
    if agent.connect().is_err() || agent.list_identities().is_err() {
        return false;
    }
    let identities = agent.identities().unwrap_or_default();
    let ok = identities
        .iter()
        .any(|identity| agent.userauth(username, identity).is_ok() && session.authenticated());
    let _ = agent.disconnect();
    ok
}

fn try_key_file(
    session: &Session,
    username: &str,
    path: &Path,
    passphrase: Option<&str>,
) -> TransferResult<()> {
    if !path.exists() {
        return Err(TransferError::key_rejected(format!(
            "private key {} does not exist",
            path.display()
        )));
    }
    session
        .userauth_pubkey_file(username, None, path, passphrase)
        .map_err(|e| {
            TransferError::key_rejected(format!(
                "key {} rejected: {}",
                path.display(),
                e.message()
            ))
        })?;
    if session.authenticated() {
        Ok(())
    } else {
        Err(TransferError::key_rejected(format!(
            "key {} not accepted",
            path.display()
        )))
    }
}

/// Agent first, then key files, then password / keyboard-interactive,
/// limited to what the credential material offers.
fn authenticate(session: &Session, auth: &AuthMaterial) -> TransferResult<&'static str> {
    match auth {
        AuthMaterial::Anonymous => Err(TransferError::auth_failed(
            "SSH requires a username; anonymous login is not possible",
        )),
        AuthMaterial::Agent { username } => {
            if try_agent(session, username) {
                return Ok("agent");
            }
            for path in default_identities() {
                if try_key_file(session, username, &path, None).is_ok() {
                    return Ok("publickey-default");
                }
            }
            Err(TransferError::key_rejected(format!(
                "no agent or default identity accepted for {}",
                username
            )))
        }
        AuthMaterial::KeyFile {
            username,
            path,
            passphrase,
        } => {
            let passphrase = passphrase.as_ref().map(|p| p.expose_secret().as_str());
            try_key_file(session, username, path, passphrase)?;
            Ok("publickey")
        }
        AuthMaterial::Password { username, password } => {
            let password = password.expose_secret();
            if session.userauth_password(username, password).is_ok() && session.authenticated() {
                return Ok("password");
            }
            let mut prompt = PasswordPrompt { password };
            if session
                .userauth_keyboard_interactive(username, &mut prompt)
                .is_ok()
                && session.authenticated()
            {
                return Ok("keyboard-interactive");
            }
            Err(TransferError::auth_failed(format!(
                "password rejected for {}",
                username
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkd_core::ErrorKind;

    #[test]
    fn unresolvable_host_is_dns_failure() {
        let err = resolve("no-such-host.invalid:22").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DnsFailure);
    }

    #[test]
    fn literal_address_resolves() {
        let addr = resolve("127.0.0.1:2222").unwrap();
        assert_eq!(addr.port(), 2222);
    }

    #[test]
    fn missing_key_file_is_an_auth_error() {
        let session = Session::new().unwrap();
        let err = try_key_file(&session, "alice", Path::new("/nonexistent/id_ed25519"), None)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::KeyRejected);
        assert_eq!(err.category(), pkd_core::ErrorCategory::Auth);
    }

    #[test]
    fn anonymous_is_rejected_without_network() {
        let session = Session::new().unwrap();
        let err = authenticate(&session, &AuthMaterial::Anonymous).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidCredentials);
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = blocking(move || handshake(&addr, Duration::from_secs(2), Duration::ZERO))
            .await
            .err()
            .unwrap();
        assert_eq!(err.category(), pkd_core::ErrorCategory::Connection);
    }
}
