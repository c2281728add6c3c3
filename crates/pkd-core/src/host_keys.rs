//! Known-hosts records and SSH host-key verification.

use crate::error::{TransferError, TransferResult};
use crate::providers::{HostKeyDecision, HostKeyPrompt};
use crate::types::{Endpoint, HostKeyPolicy};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use std::collections::HashMap;
use std::sync::RwLock;

/// Endpoint key → trusted fingerprint.
pub trait KnownHosts: Send + Sync {
    fn lookup(&self, endpoint_key: &str) -> Option<String>;

    fn trust(&self, endpoint_key: &str, fingerprint: &str);
}

#[derive(Default)]
pub struct MemoryKnownHosts {
    records: RwLock<HashMap<String, String>>,
}

impl MemoryKnownHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KnownHosts for MemoryKnownHosts {
    fn lookup(&self, endpoint_key: &str) -> Option<String> {
        self.records.read().ok()?.get(endpoint_key).cloned()
    }

    fn trust(&self, endpoint_key: &str, fingerprint: &str) {
        if let Ok(mut records) = self.records.write() {
            records.insert(endpoint_key.to_string(), fingerprint.to_string());
        }
    }
}

/// OpenSSH-style `SHA256:<base64>` rendering of a host-key hash.
pub fn format_fingerprint(sha256: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(sha256))
}

/// Check `fingerprint` against the known-hosts record for `endpoint`.
///
/// A recorded fingerprint that differs is always a mismatch. An unknown
/// fingerprint is handled per the endpoint's [`HostKeyPolicy`]; the record
/// is written only after acceptance.
pub async fn verify_host_key(
    endpoint: &Endpoint,
    fingerprint: &str,
    known_hosts: &dyn KnownHosts,
    prompt: &dyn HostKeyPrompt,
) -> TransferResult<()> {
    let key = endpoint.key();
    if let Some(trusted) = known_hosts.lookup(&key) {
        if trusted == fingerprint {
            return Ok(());
        }
        log::error!(
            "Host key for {} changed: trusted {}, presented {}",
            key,
            trusted,
            fingerprint
        );
        return Err(TransferError::host_key_mismatch(format!(
            "host key for {} does not match the trusted fingerprint (presented {})",
            key, fingerprint
        )));
    }

    match endpoint.host_key_policy {
        HostKeyPolicy::AutoAdd => {
            log::info!("Recording new host key {} for {}", fingerprint, key);
            known_hosts.trust(&key, fingerprint);
            Ok(())
        }
        HostKeyPolicy::Strict => Err(TransferError::host_key_mismatch(format!(
            "unknown host key {} for {} (strict policy)",
            fingerprint, key
        ))),
        HostKeyPolicy::Prompt => match prompt.decide(endpoint, fingerprint).await {
            HostKeyDecision::Accept => {
                log::info!("Host key {} for {} accepted", fingerprint, key);
                known_hosts.trust(&key, fingerprint);
                Ok(())
            }
            HostKeyDecision::Reject => Err(TransferError::host_key_mismatch(format!(
                "host key {} for {} was rejected",
                fingerprint, key
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::Protocol;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPrompt {
        answer: HostKeyDecision,
        asked: AtomicUsize,
    }

    impl CountingPrompt {
        fn new(answer: HostKeyDecision) -> Self {
            Self {
                answer,
                asked: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HostKeyPrompt for CountingPrompt {
        async fn decide(&self, _endpoint: &Endpoint, _fingerprint: &str) -> HostKeyDecision {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn sftp() -> Endpoint {
        Endpoint::new(Protocol::Sftp, "files.example.com")
    }

    #[test]
    fn fingerprint_format() {
        assert_eq!(format_fingerprint(&[0u8; 3]), "SHA256:AAAA");
        assert_eq!(format_fingerprint(&[0xff, 0xee]), "SHA256:/+4");
    }

    #[tokio::test]
    async fn prompt_accept_records_then_mismatch_fails_without_prompt() {
        let known = MemoryKnownHosts::new();
        let prompt = CountingPrompt::new(HostKeyDecision::Accept);

        verify_host_key(&sftp(), "SHA256:first", &known, &prompt)
            .await
            .unwrap();
        assert_eq!(known.lookup(&sftp().key()).as_deref(), Some("SHA256:first"));
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);

        // Same key again: no prompt.
        verify_host_key(&sftp(), "SHA256:first", &known, &prompt)
            .await
            .unwrap();
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);

        let err = verify_host_key(&sftp(), "SHA256:second", &known, &prompt)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::HostKeyMismatch);
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
        assert_eq!(known.lookup(&sftp().key()).as_deref(), Some("SHA256:first"));
    }

    #[tokio::test]
    async fn prompt_reject_leaves_no_record() {
        let known = MemoryKnownHosts::new();
        let prompt = CountingPrompt::new(HostKeyDecision::Reject);
        let err = verify_host_key(&sftp(), "SHA256:x", &known, &prompt)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::HostKeyMismatch);
        assert!(known.is_empty());
    }

    #[tokio::test]
    async fn strict_and_auto_add_policies() {
        let known = MemoryKnownHosts::new();
        let prompt = CountingPrompt::new(HostKeyDecision::Accept);

        let strict = sftp().with_host_key_policy(HostKeyPolicy::Strict);
        let err = verify_host_key(&strict, "SHA256:x", &known, &prompt)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::HostKeyMismatch);

        let auto = sftp().with_host_key_policy(HostKeyPolicy::AutoAdd);
        verify_host_key(&auto, "SHA256:x", &known, &prompt)
            .await
            .unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 0);

        let err = verify_host_key(&auto, "SHA256:y", &known, &prompt)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::HostKeyMismatch);
    }
}
