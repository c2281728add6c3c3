//! Low-level WebDAV HTTP client.
//!
//! Requests are built on `reqwest`; status codes and transport failures are
//! mapped onto the shared error taxonomy here so the session layer only
//! deals with `TransferError`.

use crate::xml::{self, DavResource};
use bytes::Bytes;
use futures::Stream;
use pkd_core::{AuthMaterial, Endpoint, ErrorKind, TransferError, TransferResult};
use reqwest::{header, Body, Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::error::Error as _;
use std::time::Duration;
use url::Url;

/// Server features learned from `OPTIONS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerFeatures {
    /// `Accept-Ranges: bytes`.
    pub ranges: bool,
    /// sabre/dav partial updates (`PATCH` with `X-Update-Range`).
    pub partial_update: bool,
}

impl ServerFeatures {
    pub fn from_headers(headers: &header::HeaderMap) -> Self {
        let joined = |name: &str| -> String {
            headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(",")
                .to_lowercase()
        };
        Self {
            ranges: joined("accept-ranges")
                .split(',')
                .any(|v| v.trim() == "bytes"),
            partial_update: joined("dav").contains("sabredav-partialupdate"),
        }
    }
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base: Url,
    credentials: Option<(String, SecretString)>,
    io_timeout: Duration,
}

fn method(name: &'static str) -> TransferResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| TransferError::protocol(format!("invalid method {}: {}", name, e)))
}

/// Base URL for an endpoint, always ending in `/`.
pub fn base_url(endpoint: &Endpoint) -> TransferResult<Url> {
    let scheme = if endpoint.webdav_tls { "https" } else { "http" };
    let base_path = endpoint.webdav_base_path.as_deref().unwrap_or("/");
    let raw = format!(
        "{}://{}:{}/{}",
        scheme,
        endpoint.host,
        endpoint.effective_port(),
        base_path.trim_matches('/')
    );
    let mut url = Url::parse(&raw)
        .map_err(|e| TransferError::invalid_config(format!("bad WebDAV URL {}: {}", raw, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Map an HTTP failure status onto the taxonomy.
pub fn map_status(status: StatusCode, context: &str) -> TransferError {
    let message = format!("{} → {}", context, status);
    let kind = match status.as_u16() {
        401 => ErrorKind::InvalidCredentials,
        403 | 423 => ErrorKind::PermissionDenied,
        404 | 409 | 410 => ErrorKind::NotFound,
        413 | 507 => ErrorKind::QuotaExceeded,
        416 => ErrorKind::ResumeMismatch,
        408 | 504 => ErrorKind::Timeout,
        429 | 503 => ErrorKind::ServerBusy,
        502 => ErrorKind::ConnectionReset,
        405 | 501 => ErrorKind::Unsupported,
        _ => ErrorKind::ProtocolViolation,
    };
    TransferError::new(kind, message).with_code(status.as_u16() as u32)
}

/// Map a transport-level `reqwest` failure.
pub fn map_reqwest(context: &str, e: &reqwest::Error) -> TransferError {
    let mut chain = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        chain.push_str(": ");
        chain.push_str(&s.to_string());
        source = s.source();
    }
    let message = format!("{}: {}", context, chain);
    let lower = chain.to_lowercase();
    if e.is_timeout() {
        TransferError::timeout(message)
    } else if lower.contains("dns error") || lower.contains("failed to lookup") {
        TransferError::dns(message)
    } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("handshake")
    {
        TransferError::tls(message)
    } else if e.is_connect() {
        TransferError::connection_refused(message)
    } else {
        TransferError::connection_reset(message)
    }
}

impl DavClient {
    pub fn new(
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        io_timeout: Duration,
    ) -> TransferResult<Self> {
        let credentials = match auth {
            AuthMaterial::Anonymous => None,
            AuthMaterial::Password { username, password } => {
                Some((username.clone(), password.clone()))
            }
            AuthMaterial::KeyFile { .. } | AuthMaterial::Agent { .. } => {
                return Err(TransferError::auth_failed(
                    "WebDAV supports anonymous or password authentication only",
                ))
            }
        };
        let http = Client::builder()
            .connect_timeout(io_timeout)
            .danger_accept_invalid_certs(endpoint.accept_invalid_certs)
            .user_agent(concat!("portkeydrop/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransferError::tls(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base: base_url(endpoint)?,
            credentials,
            io_timeout,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// URL of a remote path below the base, percent-encoding each segment.
    pub fn url_for(&self, path: &str) -> TransferResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransferError::invalid_config("WebDAV base URL cannot have a path"))?;
            segments.pop_if_empty();
            for seg in path.split('/').filter(|s| !s.is_empty()) {
                segments.push(seg);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.http.request(method, url);
        match &self.credentials {
            Some((user, pass)) => req.basic_auth(user, Some(pass.expose_secret())),
            None => req,
        }
    }

    /// Send with the I/O timeout applied to the response headers.
    async fn send(&self, req: RequestBuilder, context: &str) -> TransferResult<Response> {
        match tokio::time::timeout(self.io_timeout, req.send()).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(map_reqwest(context, &e)),
            Err(_) => Err(TransferError::timeout(format!("{}: no response", context))),
        }
    }

    async fn expect_success(&self, req: RequestBuilder, context: &str) -> TransferResult<Response> {
        let resp = self.send(req, context).await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(map_status(resp.status(), context))
        }
    }

    // ── WebDAV methods ───────────────────────────────────────────────

    pub async fn options(&self) -> TransferResult<ServerFeatures> {
        let req = self.request(Method::OPTIONS, self.base.clone());
        let resp = self.expect_success(req, "OPTIONS").await?;
        Ok(ServerFeatures::from_headers(resp.headers()))
    }

    pub async fn propfind(&self, path: &str, depth: u8) -> TransferResult<Vec<DavResource>> {
        let context = format!("PROPFIND {}", path);
        let req = self
            .request(method("PROPFIND")?, self.url_for(path)?)
            .header("Depth", depth.to_string())
            .header(header::CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(xml::PROPFIND_BODY);
        let resp = self.send(req, &context).await?;
        let status = resp.status();
        if status != StatusCode::MULTI_STATUS && !status.is_success() {
            return Err(map_status(status, &context));
        }
        let text = tokio::time::timeout(self.io_timeout, resp.text())
            .await
            .map_err(|_| TransferError::timeout(format!("{}: body timed out", context)))?
            .map_err(|e| map_reqwest(&context, &e))?;
        xml::parse_multistatus(&text)
    }

    /// `GET` from `offset`. A server that ignores the range is reported as
    /// `Unsupported` rather than silently restarting at zero.
    pub async fn get(&self, path: &str, offset: u64) -> TransferResult<Response> {
        let context = format!("GET {}", path);
        let mut req = self.request(Method::GET, self.url_for(path)?);
        if offset > 0 {
            req = req.header(header::RANGE, format!("bytes={}-", offset));
        }
        let resp = self.expect_success(req, &context).await?;
        if offset > 0 && resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::unsupported(format!(
                "{}: server ignored the byte range",
                context
            )));
        }
        Ok(resp)
    }

    /// Build a streamed upload request. `offset > 0` continues an existing
    /// resource through a sabre/dav partial update.
    pub fn upload_request<S>(&self, path: &str, offset: u64, body: S) -> TransferResult<RequestBuilder>
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static,
    {
        let url = self.url_for(path)?;
        let body = Body::wrap_stream(body);
        if offset == 0 {
            return Ok(self
                .request(Method::PUT, url)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(body));
        }
        Ok(self
            .request(Method::PATCH, url)
            .header(header::CONTENT_TYPE, "application/x-sabredav-partialupdate")
            .header("X-Update-Range", format!("bytes={}-", offset))
            .body(body))
    }

    /// Send a request built by [`upload_request`](Self::upload_request). No
    /// overall timeout applies; the body stream paces the request.
    pub async fn send_upload(&self, req: RequestBuilder, context: &str) -> TransferResult<()> {
        let resp = req.send().await.map_err(|e| map_reqwest(context, &e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(map_status(resp.status(), context))
        }
    }

    pub async fn mkcol(&self, path: &str) -> TransferResult<()> {
        let req = self.request(method("MKCOL")?, self.url_for(path)?);
        self.expect_success(req, &format!("MKCOL {}", path))
            .await
            .map(|_| ())
    }

    pub async fn delete(&self, path: &str) -> TransferResult<()> {
        let req = self.request(Method::DELETE, self.url_for(path)?);
        self.expect_success(req, &format!("DELETE {}", path))
            .await
            .map(|_| ())
    }

    pub async fn move_to(&self, from: &str, to: &str) -> TransferResult<()> {
        let destination = self.url_for(to)?;
        let req = self
            .request(method("MOVE")?, self.url_for(from)?)
            .header("Destination", destination.as_str())
            .header("Overwrite", "T");
        self.expect_success(req, &format!("MOVE {} → {}", from, to))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkd_core::Protocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn endpoint(base: Option<&str>) -> Endpoint {
        let mut ep = Endpoint::new(Protocol::WebDav, "files.example.com");
        ep.webdav_base_path = base.map(str::to_string);
        ep
    }

    /// Serve one canned HTTP response and hand back the raw request head.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if sock.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                head.push(byte[0]);
            }
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
            String::from_utf8_lossy(&head).into_owned()
        });
        (format!("127.0.0.1:{}", port), handle)
    }

    fn local_client(addr: &str) -> DavClient {
        let (host, port) = addr.split_once(':').unwrap();
        let mut ep = Endpoint::new(Protocol::WebDav, host).with_port(port.parse().unwrap());
        ep.webdav_tls = false;
        ep.webdav_base_path = Some("/dav".into());
        DavClient::new(
            &ep,
            &AuthMaterial::password("alice", "s3cret"),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn base_url_always_ends_with_slash() {
        assert_eq!(
            base_url(&endpoint(None)).unwrap().as_str(),
            "https://files.example.com/"
        );
        assert_eq!(
            base_url(&endpoint(Some("/remote.php/dav/files/alice"))).unwrap().path(),
            "/remote.php/dav/files/alice/"
        );
    }

    #[test]
    fn paths_are_percent_encoded_per_segment() {
        let client = DavClient::new(
            &endpoint(Some("/dav")),
            &AuthMaterial::Anonymous,
            Duration::from_secs(5),
        )
        .unwrap();
        let url = client.url_for("/my docs/a#1.txt").unwrap();
        assert_eq!(url.path(), "/dav/my%20docs/a%231.txt");
        assert_eq!(client.url_for("/").unwrap().path(), "/dav");
    }

    #[test]
    fn key_auth_is_rejected() {
        let auth = AuthMaterial::Agent {
            username: "bob".into(),
        };
        let err = DavClient::new(&endpoint(None), &auth, Duration::from_secs(1))
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidCredentials);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            map_status(StatusCode::UNAUTHORIZED, "GET").kind,
            ErrorKind::InvalidCredentials
        );
        assert_eq!(map_status(StatusCode::NOT_FOUND, "GET").kind, ErrorKind::NotFound);
        assert_eq!(
            map_status(StatusCode::INSUFFICIENT_STORAGE, "PUT").kind,
            ErrorKind::QuotaExceeded
        );
        assert!(map_status(StatusCode::SERVICE_UNAVAILABLE, "GET").is_transient());
        assert!(!map_status(StatusCode::FORBIDDEN, "GET").is_transient());
        assert_eq!(map_status(StatusCode::NOT_FOUND, "GET").code, Some(404));
    }

    #[test]
    fn features_from_options_headers() {
        let mut headers = header::HeaderMap::new();
        headers.insert("dav", "1, 2, 3, sabredav-partialupdate".parse().unwrap());
        headers.insert("accept-ranges", "bytes".parse().unwrap());
        let f = ServerFeatures::from_headers(&headers);
        assert!(f.ranges && f.partial_update);
        assert_eq!(
            ServerFeatures::from_headers(&header::HeaderMap::new()),
            ServerFeatures::default()
        );
    }

    #[tokio::test]
    async fn ranged_get_sends_range_and_basic_auth() {
        let (addr, server) = serve_once(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: 3\r\nContent-Range: bytes 7-9/10\r\n\r\nxyz",
        )
        .await;
        let client = local_client(&addr);
        let resp = client.get("/f.bin", 7).await.unwrap();
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"xyz");
        let head = server.await.unwrap();
        assert!(head.starts_with("GET /dav/f.bin "));
        assert!(head.to_lowercase().contains("range: bytes=7-"));
        assert!(head.to_lowercase().contains("authorization: basic "));
    }

    #[tokio::test]
    async fn ignored_range_is_unsupported() {
        let (addr, _server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nfull").await;
        let client = local_client(&addr);
        let err = client.get("/f.bin", 2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn missing_resource_maps_to_not_found() {
        let (addr, _server) =
            serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
        let client = local_client(&addr);
        let err = client.propfind("/nope", 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
