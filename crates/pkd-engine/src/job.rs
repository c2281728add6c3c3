//! Transfer jobs, their state machine and cancellation flag.

use chrono::{DateTime, Utc};
use pkd_core::{Direction, TransferError, TransferResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Opaque job identifier assigned at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Legal edges of the job state machine.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Active)
                | (Queued, Cancelled)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Queued)
                | (Active, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a caller asks for: one file, one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Resolved through the `CredentialProvider`.
    pub site_id: String,
    pub direction: Direction,
    pub remote_path: String,
    pub local_path: PathBuf,
}

impl TransferRequest {
    pub fn download(
        site_id: impl Into<String>,
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            direction: Direction::Download,
            remote_path: remote_path.into(),
            local_path: local_path.into(),
        }
    }

    pub fn upload(
        site_id: impl Into<String>,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            direction: Direction::Upload,
            remote_path: remote_path.into(),
            local_path: local_path.into(),
        }
    }

    /// Rejects requests that can never run.
    pub fn validate(&self) -> TransferResult<()> {
        if self.site_id.trim().is_empty() {
            return Err(TransferError::invalid_job("site id is empty"));
        }
        if self.remote_path.trim().is_empty() {
            return Err(TransferError::invalid_job("remote path is empty"));
        }
        if self.local_path.as_os_str().is_empty() {
            return Err(TransferError::invalid_job("local path is empty"));
        }
        Ok(())
    }

    pub fn source(&self) -> String {
        match self.direction {
            Direction::Download => self.remote_path.clone(),
            Direction::Upload => self.local_path.display().to_string(),
        }
    }

    pub fn destination(&self) -> String {
        match self.direction {
            Direction::Download => self.local_path.display().to_string(),
            Direction::Upload => self.remote_path.clone(),
        }
    }
}

// ── Cancellation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stop; partial data handled per the resume-partial setting.
    Cancel,
    /// Stop and always keep the partial data.
    Pause,
    /// Engine shutdown; partial data is kept.
    Shutdown,
}

const REASON_NONE: u8 = 0;

fn encode(reason: StopReason) -> u8 {
    match reason {
        StopReason::Cancel => 1,
        StopReason::Pause => 2,
        StopReason::Shutdown => 3,
    }
}

fn decode(raw: u8) -> Option<StopReason> {
    match raw {
        1 => Some(StopReason::Cancel),
        2 => Some(StopReason::Pause),
        3 => Some(StopReason::Shutdown),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    reason: AtomicU8,
    notify: Notify,
}

/// Cooperative stop flag shared between the caller and the worker.
/// The first request wins; later ones are ignored.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<CancelInner>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a stop was already requested.
    pub fn request(&self, reason: StopReason) -> bool {
        let won = self
            .0
            .reason
            .compare_exchange(REASON_NONE, encode(reason), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.0.notify.notify_waiters();
        }
        won
    }

    pub fn reason(&self) -> Option<StopReason> {
        decode(self.0.reason.load(Ordering::Acquire))
    }

    pub fn is_set(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) -> StopReason {
        loop {
            let notified = self.0.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

// ── Job record ───────────────────────────────────────────────────────

/// The scheduler's record of one job. Only the scheduler mutates it.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: JobId,
    /// Enqueue order; FIFO key.
    pub seq: u64,
    pub request: TransferRequest,
    pub state: JobState,
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    pub attempt: u32,
    pub last_error: Option<TransferError>,
    pub resume_offset: u64,
    pub paused: bool,
    /// Highest progress milestone already announced.
    pub last_milestone: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel: CancelFlag,
}

impl TransferJob {
    pub fn new(seq: u64, request: TransferRequest) -> Self {
        Self {
            id: JobId::new(),
            seq,
            request,
            state: JobState::Queued,
            total_bytes: None,
            transferred_bytes: 0,
            attempt: 0,
            last_error: None,
            resume_offset: 0,
            paused: false,
            last_milestone: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel: CancelFlag::new(),
        }
    }

    /// Move to `next`, refusing illegal edges and any change after a
    /// terminal state.
    pub fn transition(&mut self, next: JobState) -> TransferResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(TransferError::invalid_job(format!(
                "job {}: illegal transition {} → {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        match next {
            JobState::Active => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            JobState::Completed => {
                self.last_error = None;
                self.finished_at = Some(Utc::now());
            }
            JobState::Failed | JobState::Cancelled => {
                self.finished_at = Some(Utc::now());
            }
            JobState::Queued => {}
        }
        Ok(())
    }

    /// Record progress. Bytes never go backwards while active and never
    /// exceed a known total.
    pub fn record_progress(&mut self, transferred: u64) {
        let capped = match self.total_bytes {
            Some(total) => transferred.min(total),
            None => transferred,
        };
        if capped > self.transferred_bytes {
            self.transferred_bytes = capped;
        }
    }

    pub fn percent(&self) -> Option<u8> {
        self.total_bytes.map(|total| percent_of(self.transferred_bytes, total))
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            site_id: self.request.site_id.clone(),
            direction: self.request.direction,
            source_path: self.request.source(),
            dest_path: self.request.destination(),
            state: self.state,
            paused: self.paused,
            total_bytes: self.total_bytes,
            transferred_bytes: self.transferred_bytes,
            percent: self.percent(),
            attempt: self.attempt,
            last_error: self.last_error.as_ref().map(|e| format!("{}", e)),
            last_error_kind: self.last_error.as_ref().map(|e| format!("{:?}", e.kind)),
            resume_offset: self.resume_offset,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Integer percentage; an empty file is complete.
pub fn percent_of(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((bytes.min(total) as u128 * 100) / total as u128) as u8
}

/// Point-in-time view of a job for polling callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub site_id: String,
    pub direction: Direction,
    pub source_path: String,
    pub dest_path: String,
    pub state: JobState,
    pub paused: bool,
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    pub percent: Option<u8>,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<String>,
    pub resume_offset: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
