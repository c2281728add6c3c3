//! FTP replies and their mapping onto the transfer error taxonomy.

use pkd_core::{ErrorKind, TransferError};

/// A complete (possibly multi-line) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpReply {
    /// Full reply text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of the last line without the leading code.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or("").trim())
            .unwrap_or("")
    }

    /// Positive-preliminary reply (1xx).
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Positive-completion reply (2xx).
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Positive-intermediate reply (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn into_error(self) -> TransferError {
        classify_reply(self.code, &self.text())
    }
}

/// Classify an FTP reply code into the most appropriate error kind.
pub fn classify_reply(code: u16, text: &str) -> TransferError {
    let lower = text.to_lowercase();
    let kind = match code {
        // Service closing control connection / too many users.
        421 => ErrorKind::ConnectionReset,
        425 | 426 => ErrorKind::ConnectionReset,
        430 | 530 | 532 => ErrorKind::InvalidCredentials,
        431 | 534 | 535 => ErrorKind::TlsHandshake,
        450 | 451 => ErrorKind::ServerBusy,
        452 | 552 => ErrorKind::QuotaExceeded,
        550 => {
            if lower.contains("permission") || lower.contains("denied") {
                ErrorKind::PermissionDenied
            } else if lower.contains("quota") {
                ErrorKind::QuotaExceeded
            } else {
                // "No such file or directory", "File unavailable", ...
                ErrorKind::NotFound
            }
        }
        553 => ErrorKind::PermissionDenied,
        502 | 504 => ErrorKind::Unsupported,
        _ => ErrorKind::ProtocolViolation,
    };
    TransferError::new(kind, text.to_string()).with_code(code as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_replies() {
        let e = classify_reply(421, "421 Service not available, closing control connection");
        assert_eq!(e.kind, ErrorKind::ConnectionReset);
        assert!(e.is_transient());
        assert_eq!(e.code, Some(421));
        assert!(classify_reply(426, "426 Connection closed; transfer aborted").is_transient());
        assert!(classify_reply(450, "450 File busy").is_transient());
    }

    #[test]
    fn terminal_replies() {
        assert_eq!(
            classify_reply(530, "530 Login incorrect.").kind,
            ErrorKind::InvalidCredentials
        );
        assert_eq!(
            classify_reply(550, "550 No such file or directory").kind,
            ErrorKind::NotFound
        );
        assert_eq!(
            classify_reply(550, "550 Permission denied").kind,
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            classify_reply(552, "552 Exceeded storage allocation").kind,
            ErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_reply(502, "502 Command not implemented").kind,
            ErrorKind::Unsupported
        );
        assert!(!classify_reply(552, "").is_transient());
    }

    #[test]
    fn reply_helpers() {
        let reply = FtpReply {
            code: 226,
            lines: vec!["226-Stats".into(), "226 Transfer complete".into()],
        };
        assert!(reply.is_completion());
        assert_eq!(reply.message(), "Transfer complete");
        assert_eq!(reply.text(), "226-Stats\n226 Transfer complete");
    }
}
