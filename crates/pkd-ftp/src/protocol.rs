//! Low-level FTP command/response codec (RFC 959 §4).
//!
//! Handles:
//! - Sending FTP commands terminated with `\r\n`
//! - Reading single-line and multi-line replies
//! - Parsing the 3-digit reply code

use crate::reply::FtpReply;
use pkd_core::{TransferError, TransferResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

/// Abstraction over plain TCP or TLS-wrapped read half.
pub enum ReadHalf {
    Plain(BufReader<OwnedReadHalf>),
    Tls(BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>),
}

/// Abstraction over plain TCP or TLS-wrapped write half.
pub enum WriteHalf {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

/// The FTP command/response codec operating on split halves.
pub struct FtpCodec {
    pub reader: ReadHalf,
    pub writer: WriteHalf,
    pub reply_timeout: Duration,
}

impl FtpCodec {
    pub fn from_tcp(stream: TcpStream, reply_timeout: Duration) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            reader: ReadHalf::Plain(BufReader::new(rd)),
            writer: WriteHalf::Plain(wr),
            reply_timeout,
        }
    }

    pub fn from_tls(stream: TlsStream<TcpStream>, reply_timeout: Duration) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: ReadHalf::Tls(BufReader::new(rd)),
            writer: WriteHalf::Tls(wr),
            reply_timeout,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.writer, WriteHalf::Tls(_))
    }

    /// Send a raw FTP command (CRLF is appended here).
    pub async fn send_command(&mut self, cmd: &str) -> TransferResult<()> {
        let line = format!("{}\r\n", cmd);
        match &mut self.writer {
            WriteHalf::Plain(w) => w.write_all(line.as_bytes()).await?,
            WriteHalf::Tls(w) => {
                w.write_all(line.as_bytes()).await?;
                w.flush().await?;
            }
        }
        if cmd.starts_with("PASS ") {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    async fn read_line_raw(&mut self) -> TransferResult<String> {
        let mut buf = String::new();
        let limit = self.reply_timeout;
        let read = async {
            match &mut self.reader {
                ReadHalf::Plain(r) => r.read_line(&mut buf).await,
                ReadHalf::Tls(r) => r.read_line(&mut buf).await,
            }
        };
        let n = timeout(limit, read)
            .await
            .map_err(|_| TransferError::timeout("timed out waiting for server reply"))??;
        if n == 0 {
            return Err(TransferError::connection_reset("server closed control connection"));
        }
        Ok(buf)
    }

    /// Read a complete FTP reply (possibly multi-line).
    ///
    /// Multi-line replies look like:
    /// ```text
    /// 220-Welcome to my FTP server
    /// 220-This is line 2
    /// 220 End of greeting
    /// ```
    pub async fn read_reply(&mut self) -> TransferResult<FtpReply> {
        let first = self.read_line_raw().await?;
        let first_trimmed = first.trim_end_matches(['\r', '\n']);
        let code = parse_code(first_trimmed)?;
        let mut lines = vec![first_trimmed.to_string()];

        // "NNN-" means more lines follow until "NNN " is seen.
        if first_trimmed.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line_raw().await?;
                let next_trimmed = next.trim_end_matches(['\r', '\n']);
                lines.push(next_trimmed.to_string());
                if next_trimmed.starts_with(&terminator) || next_trimmed == terminator.trim_end() {
                    break;
                }
            }
        }

        let reply = FtpReply { code, lines };
        log::trace!("<<< {} {}", reply.code, reply.message());
        Ok(reply)
    }

    /// Send a command and return the reply.
    pub async fn execute(&mut self, cmd: &str) -> TransferResult<FtpReply> {
        self.send_command(cmd).await?;
        self.read_reply().await
    }

    /// Send a command, expect a specific reply-code class.
    pub async fn expect(&mut self, cmd: &str, expected_first_digit: u16) -> TransferResult<FtpReply> {
        let reply = self.execute(cmd).await?;
        if reply.code / 100 != expected_first_digit {
            return Err(reply.into_error());
        }
        Ok(reply)
    }

    /// Expect a 2xx reply.
    pub async fn expect_ok(&mut self, cmd: &str) -> TransferResult<FtpReply> {
        self.expect(cmd, 2).await
    }

    /// Consume the final reply of a transfer whose data connection we
    /// closed early. Any final code resynchronises the control channel;
    /// 426 and 451 are the usual answers.
    pub async fn drain_transfer_reply(&mut self) -> TransferResult<FtpReply> {
        loop {
            let reply = self.read_reply().await?;
            if reply.code >= 200 {
                return Ok(reply);
            }
        }
    }
}

/// Parse the 3-digit reply code from the start of a line.
fn parse_code(line: &str) -> TransferResult<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| TransferError::protocol(format!("invalid reply line: '{}'", line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn codec_pair(server_script: &'static [u8]) -> (FtpCodec, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            if server_script.is_empty() {
                return Vec::new();
            }
            sock.write_all(server_script).await.unwrap();
            let mut received = vec![0u8; 64];
            let n = sock.read(&mut received).await.unwrap_or(0);
            received.truncate(n);
            received
        });
        let tcp = TcpStream::connect(addr).await.unwrap();
        (FtpCodec::from_tcp(tcp, Duration::from_secs(5)), server)
    }

    #[tokio::test]
    async fn reads_multiline_reply() {
        let (mut codec, _server) =
            codec_pair(b"220-Welcome\r\n220-second line\r\n220 Ready\r\n").await;
        let reply = codec.read_reply().await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.message(), "Ready");
    }

    #[tokio::test]
    async fn expect_maps_failure_codes() {
        let (mut codec, server) = codec_pair(b"550 No such file or directory\r\n").await;
        let err = codec.expect_ok("SIZE /missing").await.unwrap_err();
        assert_eq!(err.kind, pkd_core::ErrorKind::NotFound);
        assert_eq!(err.code, Some(550));
        let sent = server.await.unwrap();
        assert_eq!(sent, b"SIZE /missing\r\n");
    }

    #[tokio::test]
    async fn closed_connection_is_reset() {
        let (mut codec, _server) = codec_pair(b"").await;
        let err = codec.read_reply().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn abandoned_transfer_reply_accepts_failure_codes() {
        let (mut codec, _server) =
            codec_pair(b"150 still going\r\n426 Connection closed; transfer aborted.\r\n").await;
        let reply = codec.drain_transfer_reply().await.unwrap();
        assert_eq!(reply.code, 426);
    }

    #[tokio::test]
    async fn abandoned_transfer_reply_accepts_completion() {
        let (mut codec, _server) = codec_pair(b"226 Transfer complete\r\n").await;
        assert_eq!(codec.drain_transfer_reply().await.unwrap().code, 226);
    }

    #[test]
    fn rejects_garbage_code() {
        assert!(parse_code("hello").is_err());
        assert!(parse_code("99").is_err());
        assert_eq!(parse_code("230 ok").unwrap(), 230);
    }
}
