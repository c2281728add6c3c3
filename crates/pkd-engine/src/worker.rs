//! One attempt of one job: acquire a session, plan the resume offset, move
//! the bytes chunk by chunk, verify the destination.

use crate::job::{CancelFlag, JobId, StopReason, TransferRequest};
use crate::pool::{SessionLease, SessionPool};
use crate::queue::EngineDeps;
use crate::resume::{ResumeManager, ResumePlan};
use pkd_core::{
    read_full, ChunkReader, ChunkWriter, Direction, EngineConfig, ProtocolSession, TransferError,
    TransferResult,
};
use std::sync::Arc;
use tracing::Instrument;

/// Receives the worker's progress; implemented by the scheduler.
pub(crate) trait JobReporter: Send + Sync {
    /// The attempt planned its start offset; `total` is the source size.
    fn started(&self, id: JobId, total: Option<u64>, offset: u64, granularity: u8);

    /// `transferred` is the absolute destination position after a chunk.
    fn progress(&self, id: JobId, transferred: u64, granularity: u8);
}

/// What a worker needs to know about the job it runs.
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub id: JobId,
    pub request: TransferRequest,
    pub attempt: u32,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttemptOutcome {
    Completed { bytes: u64 },
    Failed(TransferError),
    Stopped(StopReason),
}

enum Flow {
    Done(u64),
    Stopped(StopReason),
}

pub(crate) async fn run_attempt(
    deps: &EngineDeps,
    pool: &Arc<SessionPool>,
    config: &EngineConfig,
    job: &Attempt,
    reporter: &dyn JobReporter,
) -> AttemptOutcome {
    let span = tracing::info_span!(
        "transfer",
        job_id = %job.id,
        attempt = job.attempt,
        direction = ?job.request.direction
    );
    async move {
        if let Some(reason) = job.cancel.reason() {
            return AttemptOutcome::Stopped(reason);
        }
        if let Err(e) = config.validate() {
            tracing::error!(error = %e, "configuration rejected");
            return AttemptOutcome::Failed(e);
        }
        let (endpoint, auth) = match deps.credentials.resolve(&job.request.site_id).await {
            Ok(resolved) => resolved,
            Err(e) => return AttemptOutcome::Failed(e),
        };
        let ctx = deps.connect_context(config);
        let acquire = pool.acquire(
            &job.request.site_id,
            &endpoint,
            &auth,
            &ctx,
            config.max_sessions_per_endpoint,
        );
        let mut lease = tokio::select! {
            biased;
            reason = job.cancel.stopped() => return AttemptOutcome::Stopped(reason),
            acquired = acquire => match acquired {
                Ok(lease) => lease,
                Err(e) => {
                    tracing::warn!(error = %e, "session unavailable");
                    return AttemptOutcome::Failed(e);
                }
            },
        };

        let result = transfer(&mut lease, deps, config, job, reporter).await;
        lease.release(result.as_ref().err()).await;
        match result {
            Ok(Flow::Done(bytes)) => {
                tracing::info!(bytes, "transfer complete");
                AttemptOutcome::Completed { bytes }
            }
            Ok(Flow::Stopped(reason)) => {
                tracing::info!(?reason, "transfer stopped");
                AttemptOutcome::Stopped(reason)
            }
            Err(e) => {
                tracing::warn!(error = %e, kind = ?e.kind, "transfer attempt failed");
                AttemptOutcome::Failed(e)
            }
        }
    }
    .instrument(span)
    .await
}

async fn transfer(
    lease: &mut SessionLease,
    deps: &EngineDeps,
    config: &EngineConfig,
    job: &Attempt,
    reporter: &dyn JobReporter,
) -> TransferResult<Flow> {
    let session = lease.session()?;
    let request = &job.request;
    let plan = ResumeManager::new(config.resume_partial_enabled)
        .prepare(session, deps.local.as_ref(), request)
        .await?;
    reporter.started(
        job.id,
        plan.source_size,
        plan.offset,
        config.progress_granularity,
    );
    tracing::debug!(offset = plan.offset, total = ?plan.source_size, "starting");

    let copy = ChunkCopy {
        id: job.id,
        start: plan.offset,
        total: plan.source_size,
        chunk_size: config.chunk_size,
        cancel: &job.cancel,
        reporter,
        granularity: config.progress_granularity,
    };
    let copied = match request.direction {
        Direction::Download => {
            let reader = session.open_read(&request.remote_path, plan.offset).await?;
            let writer = deps
                .local
                .create(&request.local_path, plan.offset, plan.truncate)
                .await?;
            copy.run(reader, writer).await
        }
        Direction::Upload => {
            let reader = deps.local.open(&request.local_path, plan.offset).await?;
            let writer = session
                .open_write(&request.remote_path, plan.offset, plan.truncate)
                .await?;
            copy.run(reader, writer).await
        }
    };

    match copied {
        Ok(Flow::Stopped(reason)) => {
            if !keeps_partial(reason, config) {
                discard_partial(session, deps, request).await;
            }
            Ok(Flow::Stopped(reason))
        }
        Ok(Flow::Done(bytes)) => {
            if config.verify_destination_size {
                verify_size(session, deps, request, &plan, bytes).await?;
            }
            Ok(Flow::Done(bytes))
        }
        Err(e) => {
            // A stop requested before the failure decides the partial's fate.
            if let Some(reason) = job.cancel.reason() {
                if !keeps_partial(reason, config) {
                    discard_partial(session, deps, request).await;
                }
            }
            Err(e)
        }
    }
}

fn keeps_partial(reason: StopReason, config: &EngineConfig) -> bool {
    match reason {
        StopReason::Cancel => config.resume_partial_enabled,
        StopReason::Pause | StopReason::Shutdown => true,
    }
}

struct ChunkCopy<'r> {
    id: JobId,
    start: u64,
    total: Option<u64>,
    chunk_size: usize,
    cancel: &'r CancelFlag,
    reporter: &'r dyn JobReporter,
    granularity: u8,
}

impl ChunkCopy<'_> {
    /// Stop requests are honoured between chunks only; a chunk that was
    /// read is always written.
    async fn run(
        &self,
        mut reader: Box<dyn ChunkReader + '_>,
        mut writer: Box<dyn ChunkWriter + '_>,
    ) -> TransferResult<Flow> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut pos = self.start;
        loop {
            if let Some(reason) = self.cancel.reason() {
                abandon(reader, writer).await;
                return Ok(Flow::Stopped(reason));
            }
            let n = read_full(reader.as_mut(), &mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_chunk(&buf[..n]).await?;
            pos += n as u64;
            self.reporter.progress(self.id, pos, self.granularity);
        }
        reader.finish().await?;
        writer.finish().await?;
        if pos == self.start {
            // Nothing moved (empty source or nothing left to resume).
            self.reporter.progress(self.id, pos, self.granularity);
        }
        if let Some(total) = self.total {
            if pos != total {
                return Err(TransferError::size_mismatch(total, pos));
            }
        }
        Ok(Flow::Done(pos))
    }
}

/// Release both ends of an interrupted copy so the session can serve the
/// cleanup that follows.
async fn abandon(reader: Box<dyn ChunkReader + '_>, writer: Box<dyn ChunkWriter + '_>) {
    if let Err(e) = reader.abort().await {
        tracing::debug!(error = %e, "source did not close cleanly");
    }
    if let Err(e) = writer.abort().await {
        tracing::debug!(error = %e, "destination did not close cleanly");
    }
}

async fn discard_partial(
    session: &mut dyn ProtocolSession,
    deps: &EngineDeps,
    request: &TransferRequest,
) {
    let removed = match request.direction {
        Direction::Download => deps.local.remove(&request.local_path).await,
        Direction::Upload => session.remove(&request.remote_path).await,
    };
    match removed {
        Ok(()) => tracing::info!(dest = %request.destination(), "partial destination removed"),
        Err(e) => tracing::warn!(
            dest = %request.destination(),
            error = %e,
            "could not remove partial destination"
        ),
    }
}

async fn verify_size(
    session: &mut dyn ProtocolSession,
    deps: &EngineDeps,
    request: &TransferRequest,
    plan: &ResumePlan,
    written: u64,
) -> TransferResult<()> {
    let Some(expected) = plan.source_size else {
        return Ok(());
    };
    let actual = match request.direction {
        Direction::Download => deps
            .local
            .stat(&request.local_path)
            .await?
            .map(|s| s.size),
        Direction::Upload => session.stat(&request.remote_path).await?.size,
    };
    let actual = actual.unwrap_or(written);
    if actual != expected {
        return Err(TransferError::size_mismatch(expected, actual));
    }
    Ok(())
}
