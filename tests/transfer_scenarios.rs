mod common;

use common::{harness, milestones, payload, progress_count, states, SITE};
use pkd_core::{ErrorKind, KnownHosts, MemoryKnownHosts, Protocol, TransferError};
use pkd_engine::memory::ranges_disjoint;
use portkeydrop::{EventKind, JobState, TransferRequest};
use std::sync::Arc;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn test_download_reports_every_chunk_and_each_milestone_once() {
    let mut h = harness()
        .config(|c| {
            c.chunk_size = MIB;
            c.max_concurrent = 2;
            c.progress_granularity = 25;
        })
        .start();
    let content = payload(10 * MIB);
    h.server.put_file("/data/big.bin", content.clone());

    let dest = h.local("big.bin");
    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/data/big.bin", &dest))
        .unwrap();
    let events = h.until_terminal(id).await;

    assert_eq!(progress_count(&events), 10);
    assert_eq!(milestones(&events), vec![25, 50, 75, 100]);
    assert_eq!(
        states(&events),
        vec![JobState::Queued, JobState::Active, JobState::Completed]
    );

    // Progress is monotonic and ends at the file size.
    let mut last = 0;
    for e in &events {
        if let EventKind::Progress { bytes, total, .. } = e.kind {
            assert!(bytes > last);
            assert_eq!(total, Some(10 * MIB as u64));
            last = bytes;
        }
    }
    assert_eq!(last, 10 * MIB as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

#[tokio::test]
async fn test_upload_resumes_after_connection_drop() {
    let mut h = harness()
        .config(|c| {
            c.chunk_size = 100;
        })
        .start();
    let content = payload(1000);
    let src = h.local("report.pdf");
    std::fs::write(&src, &content).unwrap();
    h.server.drop_write_after(400);

    let id = h
        .queue
        .enqueue(TransferRequest::upload(SITE, &src, "/inbox/report.pdf"))
        .unwrap();
    let events = h.until_terminal(id).await;

    assert_eq!(
        states(&events),
        vec![
            JobState::Queued,
            JobState::Active,
            JobState::Queued,
            JobState::Active,
            JobState::Completed,
        ]
    );
    let retried = events.iter().any(|e| {
        matches!(&e.kind, EventKind::Error { error, will_retry: true }
            if error.kind == ErrorKind::ConnectionReset)
    });
    assert!(retried);

    // The second attempt picks up where the first left off.
    let snap = h.queue.job(id).unwrap();
    assert_eq!(snap.attempt, 1);
    assert_eq!(snap.resume_offset, 400);
    assert_eq!(snap.transferred_bytes, 1000);

    let ranges = h.server.write_ranges("/inbox/report.pdf");
    let sent: u64 = ranges.iter().map(|r| r.len()).sum();
    assert_eq!(sent, 1000);
    assert!(ranges_disjoint(&ranges));
    assert_eq!(h.server.file("/inbox/report.pdf").unwrap(), content);
}

#[tokio::test]
async fn test_host_key_mismatch_fails_without_retry() {
    let known = Arc::new(MemoryKnownHosts::new());
    known.trust("sftp://mem.local:22", "SHA256:c29tZS1vdGhlci1rZXk");
    let builder = harness().protocol(Protocol::Sftp).known_hosts(known.clone());
    let server = builder.server();
    let mut h = builder.start();
    server.put_file("/etc/motd", b"hello".to_vec());

    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/etc/motd", h.local("motd")))
        .unwrap();
    let events = h.until_terminal(id).await;

    assert_eq!(
        states(&events),
        vec![JobState::Queued, JobState::Active, JobState::Failed]
    );
    let snap = h.queue.job(id).unwrap();
    assert_eq!(snap.attempt, 0);
    assert_eq!(snap.last_error_kind.as_deref(), Some("HostKeyMismatch"));
    assert_eq!(server.connect_count(), 1);
    assert!(!h.local("motd").exists());
}

#[tokio::test]
async fn test_cancel_without_resume_removes_partial() {
    let mut h = harness()
        .config(|c| {
            c.chunk_size = 100;
            c.resume_partial_enabled = false;
        })
        .start();
    h.server.put_file("/media/clip.mp4", payload(1000));
    h.server.set_chunk_delay(Some(Duration::from_millis(20)));

    let dest = h.local("clip.mp4");
    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/media/clip.mp4", &dest))
        .unwrap();

    loop {
        let event = h.next_for(id).await;
        if let EventKind::Progress {
            percent: Some(p), ..
        } = event.kind
        {
            if p >= 60 {
                break;
            }
        }
    }
    assert_eq!(h.queue.cancel(id).unwrap(), JobState::Active);
    let rest = h.until_terminal(id).await;

    assert_eq!(states(&rest), vec![JobState::Cancelled]);
    let snap = h.queue.job(id).unwrap();
    assert_eq!(snap.state, JobState::Cancelled);
    assert!(!snap.paused);
    assert!(snap.transferred_bytes < 1000);
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_pause_then_resume_moves_each_byte_once() {
    let mut h = harness().config(|c| c.chunk_size = 64).start();
    let content = payload(640);
    h.server.put_file("/iso/disk.img", content.clone());
    h.server.set_chunk_delay(Some(Duration::from_millis(15)));

    let dest = h.local("disk.img");
    let first = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/iso/disk.img", &dest))
        .unwrap();
    loop {
        if let EventKind::Progress { bytes, .. } = h.next_for(first).await.kind {
            if bytes >= 192 {
                break;
            }
        }
    }
    h.queue.pause(first).unwrap();
    h.until_terminal(first).await;
    let paused = h.queue.job(first).unwrap();
    assert_eq!(paused.state, JobState::Cancelled);
    assert!(paused.paused);
    assert!(dest.exists());

    h.server.set_chunk_delay(None);
    let second = h.queue.resume(first).unwrap();
    assert_ne!(second, first);
    let events = h.until_terminal(second).await;
    assert_eq!(
        states(&events),
        vec![JobState::Queued, JobState::Active, JobState::Completed]
    );

    let resumed = h.queue.job(second).unwrap();
    assert_eq!(resumed.resume_offset, paused.transferred_bytes);
    let ranges = h.server.read_ranges("/iso/disk.img");
    assert!(ranges_disjoint(&ranges));
    assert_eq!(ranges.iter().map(|r| r.len()).sum::<u64>(), 640);
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    // Milestones below the resume point are not announced again.
    let repeated = milestones(&events)
        .into_iter()
        .filter(|p| (*p as u64) * 640 / 100 <= paused.transferred_bytes)
        .count();
    assert_eq!(repeated, 0);
}

#[tokio::test]
async fn test_retry_saturation_ends_failed() {
    let mut h = harness().config(|c| c.max_retries = 2).start();
    h.server.put_file("/a.txt", b"a".to_vec());
    h.server.fail_connects([
        TransferError::timeout("connect timed out"),
        TransferError::timeout("connect timed out"),
        TransferError::timeout("connect timed out"),
    ]);

    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/a.txt", h.local("a.txt")))
        .unwrap();
    let events = h.until_terminal(id).await;

    let retry_flags: Vec<bool> = events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::Error { will_retry, .. } => Some(will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(retry_flags, vec![true, true, false]);
    assert_eq!(states(&events).last(), Some(&JobState::Failed));
    let snap = h.queue.job(id).unwrap();
    assert_eq!(snap.attempt, 2);
    assert_eq!(snap.last_error_kind.as_deref(), Some("Timeout"));
    assert_eq!(h.server.connect_count(), 3);
}

#[tokio::test]
async fn test_retry_waits_out_exponential_backoff() {
    let mut h = harness()
        .config(|c| {
            c.retry_base_delay_ms = 40;
            c.retry_max_delay_ms = 1000;
        })
        .start();
    h.server.put_file("/b.txt", b"bee".to_vec());
    h.server.fail_connects([
        TransferError::connection_refused("refused"),
        TransferError::server_busy("421 too many users"),
    ]);

    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/b.txt", h.local("b.txt")))
        .unwrap();
    let events = h.until_terminal(id).await;
    assert_eq!(states(&events).last(), Some(&JobState::Completed));

    let errors: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Error { .. }))
        .map(|e| e.at)
        .collect();
    let dispatches: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::StateChanged { state: JobState::Active }))
        .map(|e| e.at)
        .collect();
    assert_eq!(errors.len(), 2);
    assert_eq!(dispatches.len(), 3);
    assert!((dispatches[1] - errors[0]).num_milliseconds() >= 40);
    assert!((dispatches[2] - errors[1]).num_milliseconds() >= 80);
}

#[tokio::test]
async fn test_permanent_errors_are_not_retried() {
    let mut h = harness().start();
    h.server.reject_auth(true);

    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/x", h.local("x")))
        .unwrap();
    let events = h.until_terminal(id).await;

    assert_eq!(
        states(&events),
        vec![JobState::Queued, JobState::Active, JobState::Failed]
    );
    assert_eq!(h.server.connect_count(), 1);
    assert_eq!(
        h.queue.job(id).unwrap().last_error_kind.as_deref(),
        Some("InvalidCredentials")
    );
}

#[tokio::test]
async fn test_accepted_host_key_is_remembered_then_enforced() {
    use async_trait::async_trait;
    use pkd_core::{Endpoint, HostKeyDecision, HostKeyPrompt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct AcceptOnce {
        asked: AtomicUsize,
    }

    #[async_trait]
    impl HostKeyPrompt for AcceptOnce {
        async fn decide(&self, _endpoint: &Endpoint, _fingerprint: &str) -> HostKeyDecision {
            self.asked.fetch_add(1, Ordering::SeqCst);
            HostKeyDecision::Accept
        }
    }

    let known = Arc::new(MemoryKnownHosts::new());
    let prompt = Arc::new(AcceptOnce::default());
    let builder = harness()
        .protocol(Protocol::Sftp)
        .known_hosts(known.clone())
        .prompt(prompt.clone());
    let server = builder.server();
    let mut h = builder.start();
    server.put_file("/f", b"one".to_vec());

    let first = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/f", h.local("f1")))
        .unwrap();
    assert_eq!(
        states(&h.until_terminal(first).await).last(),
        Some(&JobState::Completed)
    );
    assert_eq!(
        known.lookup("sftp://mem.local:22"),
        Some(server.fingerprint())
    );

    // Force a fresh handshake against a server presenting another key.
    h.queue.disconnect_all().await;
    server.set_fingerprint("SHA256:cm90YXRlZC1ob3N0LWtleQ");
    let second = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/f", h.local("f2")))
        .unwrap();
    assert_eq!(
        states(&h.until_terminal(second).await).last(),
        Some(&JobState::Failed)
    );
    let snap = h.queue.job(second).unwrap();
    assert_eq!(snap.last_error_kind.as_deref(), Some("HostKeyMismatch"));
    assert_eq!(snap.attempt, 0);
    assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_upload_without_resume_removes_remote_partial() {
    let mut h = harness()
        .config(|c| {
            c.chunk_size = 100;
            c.resume_partial_enabled = false;
        })
        .start();
    // Like FTP, the session refuses commands until the stream is closed.
    h.server.require_transfer_completion(true);
    h.server.set_chunk_delay(Some(Duration::from_millis(20)));
    let src = h.local("report.pdf");
    std::fs::write(&src, payload(1000)).unwrap();

    let id = h
        .queue
        .enqueue(TransferRequest::upload(SITE, &src, "/inbox/report.pdf"))
        .unwrap();
    loop {
        let event = h.next_for(id).await;
        if let EventKind::Progress {
            percent: Some(p), ..
        } = event.kind
        {
            if p >= 60 {
                break;
            }
        }
    }
    assert_eq!(h.queue.cancel(id).unwrap(), JobState::Active);
    let rest = h.until_terminal(id).await;

    assert_eq!(states(&rest), vec![JobState::Cancelled]);
    assert!(!h.server.write_ranges("/inbox/report.pdf").is_empty());
    assert!(h.server.file("/inbox/report.pdf").is_none());
    // The aborted stream left the session usable, so it went back to the pool.
    assert_eq!(h.queue.pool_stats().idle_sessions, 1);
}

#[tokio::test]
async fn test_cancel_racing_a_failed_read_still_removes_partial() {
    let mut h = harness()
        .config(|c| {
            c.chunk_size = 100;
            c.resume_partial_enabled = false;
        })
        .start();
    h.server.put_file("/logs/app.log", payload(1000));
    h.server.set_chunk_delay(Some(Duration::from_millis(20)));
    // The read following the 50% mark fails after the cancel lands.
    h.server.drop_read_after(500);

    let dest = h.local("app.log");
    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/logs/app.log", &dest))
        .unwrap();
    loop {
        let event = h.next_for(id).await;
        if let EventKind::Progress { bytes, .. } = event.kind {
            if bytes >= 500 {
                break;
            }
        }
    }
    h.queue.cancel(id).unwrap();
    let rest = h.until_terminal(id).await;

    assert_eq!(states(&rest).last(), Some(&JobState::Cancelled));
    assert!(rest
        .iter()
        .all(|e| !matches!(e.kind, EventKind::Error { will_retry: true, .. })));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_empty_file_reports_full_progress() {
    let mut h = harness().config(|c| c.progress_granularity = 25).start();
    h.server.put_file("/empty.txt", Vec::new());

    let dest = h.local("empty.txt");
    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/empty.txt", &dest))
        .unwrap();
    let events = h.until_terminal(id).await;

    assert_eq!(states(&events).last(), Some(&JobState::Completed));
    assert_eq!(progress_count(&events), 1);
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::Progress {
            bytes: 0,
            total: Some(0),
            percent: Some(100)
        }
    )));
    assert_eq!(milestones(&events), vec![25, 50, 75, 100]);
    assert_eq!(std::fs::read(&dest).unwrap(), b"");
}
