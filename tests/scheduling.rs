mod common;

use common::{harness, payload, states, SITE};
use pkd_core::{ConfigProvider, Direction, EngineConfig, ErrorKind};
use portkeydrop::{EventKind, JobState, TransferRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_single_slot_runs_jobs_in_enqueue_order() {
    let mut h = harness().config(|c| c.max_concurrent = 1).start();
    let mut ids = Vec::new();
    for i in 0..5 {
        let remote = format!("/q/{}.txt", i);
        h.server.put_file(&remote, payload(32 + i));
        ids.push(
            h.queue
                .enqueue(TransferRequest::download(SITE, remote, h.local(&format!("{}.txt", i))))
                .unwrap(),
        );
    }
    let events = h.until_all_terminal(&ids).await;

    let started: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::StateChanged { state: JobState::Active }))
        .map(|e| e.job_id)
        .collect();
    let finished: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::StateChanged { state: JobState::Completed }))
        .map(|e| e.job_id)
        .collect();
    assert_eq!(started, ids);
    assert_eq!(finished, ids);

    // Listing follows enqueue order as well.
    let listed: Vec<_> = h.queue.list_jobs().into_iter().map(|s| s.id).collect();
    assert_eq!(listed, ids);
}

#[tokio::test]
async fn test_active_jobs_never_exceed_limit() {
    let mut h = harness()
        .config(|c| {
            c.max_concurrent = 3;
            c.max_sessions_per_endpoint = 3;
            c.chunk_size = 16;
        })
        .start();
    h.server.set_chunk_delay(Some(Duration::from_millis(5)));
    let mut ids = Vec::new();
    for i in 0..8 {
        let remote = format!("/c/{}.bin", i);
        h.server.put_file(&remote, payload(64));
        ids.push(
            h.queue
                .enqueue(TransferRequest::download(SITE, remote, h.local(&format!("{}.bin", i))))
                .unwrap(),
        );
    }
    let events = h.until_all_terminal(&ids).await;

    let mut active = HashSet::new();
    let mut peak = 0;
    for e in &events {
        if let EventKind::StateChanged { state } = e.kind {
            match state {
                JobState::Active => {
                    active.insert(e.job_id);
                }
                _ => {
                    active.remove(&e.job_id);
                }
            }
            peak = peak.max(active.len());
        }
    }
    assert_eq!(peak, 3);
    assert!(h.server.peak_sessions() <= 3);
    assert_eq!(h.queue.active_count(), 0);
    assert!(h
        .queue
        .list_jobs()
        .iter()
        .all(|s| s.state == JobState::Completed));
}

#[tokio::test]
async fn test_cancelling_queued_job_touches_nothing() {
    let mut h = harness().config(|c| {
        c.max_concurrent = 1;
        c.chunk_size = 8;
    })
    .start();
    h.server.put_file("/slow.bin", payload(64));
    h.server.put_file("/next.bin", payload(64));
    h.server.set_chunk_delay(Some(Duration::from_millis(10)));

    let slow = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/slow.bin", h.local("slow.bin")))
        .unwrap();
    let next_dest = h.local("next.bin");
    let next = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/next.bin", &next_dest))
        .unwrap();

    assert_eq!(h.queue.cancel(next).unwrap(), JobState::Cancelled);
    assert_eq!(h.queue.job(next).unwrap().state, JobState::Cancelled);
    h.until_all_terminal(&[slow, next]).await;

    assert_eq!(h.queue.job(slow).unwrap().state, JobState::Completed);
    assert!(h.server.read_ranges("/next.bin").is_empty());
    assert!(!next_dest.exists());
    assert_eq!(h.server.connect_count(), 1);
}

#[tokio::test]
async fn test_cancel_on_finished_job_returns_its_state() {
    let mut h = harness().start();
    h.server.put_file("/done.txt", b"done".to_vec());
    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/done.txt", h.local("done.txt")))
        .unwrap();
    h.until_terminal(id).await;

    assert_eq!(h.queue.cancel(id).unwrap(), JobState::Completed);
    assert_eq!(h.queue.pause(id).unwrap(), JobState::Completed);
    let snap = h.queue.job(id).unwrap();
    assert_eq!(snap.state, JobState::Completed);
    assert!(!snap.paused);
}

#[tokio::test]
async fn test_empty_paths_are_rejected_up_front() {
    let h = harness().start();
    for request in [
        TransferRequest::download(SITE, "", h.local("x")),
        TransferRequest::download(SITE, "/x", ""),
        TransferRequest::upload(SITE, "", "/x"),
    ] {
        let err = h.queue.enqueue(request).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidJob);
    }
    assert!(h.queue.list_jobs().is_empty());
}

#[tokio::test]
async fn test_failed_job_can_be_resumed_as_new_job() {
    let mut h = harness().config(|c| c.max_retries = 0).start();
    h.server.put_file("/r.txt", payload(40));
    h.server.fail_connects([pkd_core::TransferError::timeout("slow network")]);

    let failed = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/r.txt", h.local("r.txt")))
        .unwrap();
    assert_eq!(
        states(&h.until_terminal(failed).await).last(),
        Some(&JobState::Failed)
    );

    let again = h.queue.resume(failed).unwrap();
    assert_eq!(
        states(&h.until_terminal(again).await).last(),
        Some(&JobState::Completed)
    );
    assert_eq!(h.queue.list_jobs().len(), 2);
    assert_eq!(h.queue.prune_finished(), 2);
}

#[tokio::test]
async fn test_sessions_are_reused_across_jobs() {
    let mut h = harness().config(|c| c.max_concurrent = 1).start();
    let mut ids = Vec::new();
    for i in 0..3 {
        let remote = format!("/s/{}", i);
        h.server.put_file(&remote, payload(10));
        ids.push(
            h.queue
                .enqueue(TransferRequest::download(SITE, remote, h.local(&i.to_string())))
                .unwrap(),
        );
    }
    h.until_all_terminal(&ids).await;

    assert_eq!(h.server.connect_count(), 1);
    let stats = h.queue.pool_stats();
    assert_eq!(stats.idle_sessions, 1);
    assert_eq!(h.queue.disconnect_all().await, 1);
    assert_eq!(h.server.live_sessions(), 0);
}

#[tokio::test]
async fn test_tree_upload_then_download_round_trip() {
    let mut h = harness().start();
    let src = h.local("project");
    std::fs::create_dir_all(src.join("src/bin")).unwrap();
    std::fs::write(src.join("Cargo.toml"), b"[package]").unwrap();
    std::fs::write(src.join("src/lib.rs"), b"pub fn a() {}").unwrap();
    std::fs::write(src.join("src/bin/tool.rs"), b"fn main() {}").unwrap();

    let up = h
        .queue
        .enqueue_tree(SITE, Direction::Upload, "/proj", &src)
        .await
        .unwrap();
    assert_eq!(up.len(), 3);
    h.until_all_terminal(&up).await;
    assert!(h.server.has_dir("/proj/src/bin"));

    let back = h.local("copy");
    let down = h
        .queue
        .enqueue_tree(SITE, Direction::Download, "/proj", &back)
        .await
        .unwrap();
    assert_eq!(down.len(), 3);
    h.until_all_terminal(&down).await;
    assert_eq!(std::fs::read(back.join("src/bin/tool.rs")).unwrap(), b"fn main() {}");
    assert_eq!(std::fs::read(back.join("Cargo.toml")).unwrap(), b"[package]");
}

/// Hands out whatever it holds, valid or not.
struct UncheckedConfig(EngineConfig);

impl ConfigProvider for UncheckedConfig {
    fn current(&self) -> EngineConfig {
        self.0.clone()
    }
}

#[tokio::test]
async fn test_zero_chunk_size_fails_instead_of_completing() {
    let config = EngineConfig {
        chunk_size: 0,
        verify_destination_size: false,
        ..EngineConfig::default()
    };
    let mut h = harness()
        .config_provider(Arc::new(UncheckedConfig(config)))
        .start();
    h.server.put_file("/data.csv", payload(128));

    let dest = h.local("data.csv");
    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/data.csv", &dest))
        .unwrap();
    let events = h.until_terminal(id).await;

    assert_eq!(states(&events).last(), Some(&JobState::Failed));
    let snap = h.queue.job(id).unwrap();
    assert_eq!(snap.last_error_kind.as_deref(), Some("InvalidConfig"));
    assert!(h.server.read_ranges("/data.csv").is_empty());
    assert_eq!(h.server.connect_count(), 0);
}

#[tokio::test]
async fn test_zero_concurrency_fails_jobs_instead_of_stalling() {
    let config = EngineConfig {
        max_concurrent: 0,
        ..EngineConfig::default()
    };
    let mut h = harness()
        .config_provider(Arc::new(UncheckedConfig(config)))
        .start();
    let mut ids = Vec::new();
    for i in 0..2 {
        let remote = format!("/z/{}", i);
        h.server.put_file(&remote, payload(16));
        ids.push(
            h.queue
                .enqueue(TransferRequest::download(SITE, remote, h.local(&i.to_string())))
                .unwrap(),
        );
    }
    h.until_all_terminal(&ids).await;

    for id in ids {
        let snap = h.queue.job(id).unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.last_error_kind.as_deref(), Some("InvalidConfig"));
    }
}

#[tokio::test]
async fn test_source_shorter_than_announced_is_a_size_mismatch() {
    let mut h = harness()
        .config(|c| {
            c.max_retries = 0;
            c.verify_destination_size = false;
            c.chunk_size = 4;
        })
        .start();
    h.server.put_file("/shrink.txt", payload(12));
    h.server.set_chunk_delay(Some(Duration::from_millis(5)));

    let id = h
        .queue
        .enqueue(TransferRequest::download(SITE, "/shrink.txt", h.local("shrink.txt")))
        .unwrap();
    // Truncate the source once the copy is under way.
    loop {
        if let EventKind::Progress { .. } = h.next_for(id).await.kind {
            h.server.put_file("/shrink.txt", payload(6));
            break;
        }
    }
    let rest = h.until_terminal(id).await;

    assert_eq!(states(&rest).last(), Some(&JobState::Failed));
    assert_eq!(
        h.queue.job(id).unwrap().last_error_kind.as_deref(),
        Some("SizeMismatch")
    );
}
