//! TLS helpers for Explicit and Implicit FTPS (RFC 4217).
//!
//! - Builds a rustls `TlsConnector` backed by the platform trust store, or
//!   one that accepts any certificate when the endpoint opts in.
//! - Provides `upgrade_to_tls` for wrapping an existing plain codec.
//!
//! The same connector is reused for the data channels of a session so that
//! servers requiring TLS session reuse (`require_ssl_reuse`) accept them.

use crate::protocol::{FtpCodec, ReadHalf, WriteHalf};
use pkd_core::{TransferError, TransferResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Build a `TlsConnector` according to the endpoint's certificate policy.
pub fn build_tls_connector(accept_invalid_certs: bool) -> TransferResult<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransferError::tls(format!("TLS configuration: {}", e)))?;

    let config = if accept_invalid_certs {
        log::warn!("FTPS certificate verification disabled for this endpoint");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            log::warn!("Skipping unreadable system certificate: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        log::debug!("Loaded {} system root certificates ({} ignored)", added, ignored);
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name(host: &str) -> TransferResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| TransferError::tls(format!("invalid TLS server name '{}': {}", host, e)))
}

/// Perform a client handshake over an established TCP stream.
pub async fn handshake(
    connector: &TlsConnector,
    host: &str,
    tcp: TcpStream,
    what: &str,
) -> TransferResult<TlsStream<TcpStream>> {
    connector
        .connect(server_name(host)?, tcp)
        .await
        .map_err(|e| TransferError::tls(format!("{} TLS handshake: {}", what, e)))
}

/// Upgrade an existing **plain** control connection to TLS.
///
/// Called after a successful `AUTH TLS` + 234 reply.
pub async fn upgrade_to_tls(
    codec: FtpCodec,
    host: &str,
    connector: &TlsConnector,
) -> TransferResult<FtpCodec> {
    let reply_timeout = codec.reply_timeout;
    let tcp = reunite_plain(codec)?;
    let tls = handshake(connector, host, tcp, "Explicit").await?;
    Ok(FtpCodec::from_tls(tls, reply_timeout))
}

/// Reunite the read + write halves back into a `TcpStream`.
fn reunite_plain(codec: FtpCodec) -> TransferResult<TcpStream> {
    let rd = match codec.reader {
        ReadHalf::Plain(br) => {
            if !br.buffer().is_empty() {
                return Err(TransferError::protocol(
                    "unexpected data buffered before TLS upgrade",
                ));
            }
            br.into_inner()
        }
        ReadHalf::Tls(_) => {
            return Err(TransferError::protocol(
                "cannot upgrade: connection is already TLS",
            ))
        }
    };
    let wr = match codec.writer {
        WriteHalf::Plain(w) => w,
        WriteHalf::Tls(_) => {
            return Err(TransferError::protocol(
                "cannot upgrade: connection is already TLS",
            ))
        }
    };
    rd.reunite(wr)
        .map_err(|e| TransferError::protocol(format!("reunite failed: {}", e)))
}

/// Certificate verifier used when `accept_invalid_certs` is set. Signatures
/// are still checked so the handshake itself stays sound.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
