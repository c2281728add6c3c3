//! Transfer queue: bounded-concurrency FIFO scheduler owning every job's
//! lifecycle, with retry/backoff, cooperative cancellation, pause/resume and
//! the event stream.
//!
//! All job-table mutations go through one `std::sync::Mutex`; the lock is
//! never held across an `.await`, and byte copying happens in worker tasks
//! outside it.

use crate::events::{crossed_milestones, EventBus, EventKind, EventStream};
use crate::job::{percent_of, JobId, JobSnapshot, JobState, StopReason, TransferJob, TransferRequest};
use crate::local::TokioFilesystem;
use crate::pool::{spawn_pool_maintenance, PoolStats, SessionPool};
use crate::retry::{RetryDecision, RetryManager};
use crate::worker::{run_attempt, Attempt, AttemptOutcome, JobReporter};
use pkd_core::{
    join_remote, ConfigProvider, ConnectContext, CredentialProvider, Direction, EngineConfig,
    ErrorKind, HostKeyPrompt, KnownHosts, LocalFilesystem, MemoryKnownHosts, ProtocolSession,
    RejectUnknownHosts, SessionFactory, StaticConfigProvider, TransferError, TransferResult,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

const EVENT_CAPACITY: usize = 1024;

// ── Collaborators ────────────────────────────────────────────────────

/// Everything the engine consumes from the outside world.
#[derive(Clone)]
pub struct EngineDeps {
    pub factory: Arc<dyn SessionFactory>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub config: Arc<dyn ConfigProvider>,
    pub local: Arc<dyn LocalFilesystem>,
    pub known_hosts: Arc<dyn KnownHosts>,
    pub host_key_prompt: Arc<dyn HostKeyPrompt>,
}

impl EngineDeps {
    /// Default configuration, the tokio filesystem, an empty in-memory
    /// known-hosts store and a prompt that rejects unknown host keys.
    pub fn new(factory: Arc<dyn SessionFactory>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            factory,
            credentials,
            config: Arc::new(StaticConfigProvider::default()),
            local: Arc::new(TokioFilesystem::new()),
            known_hosts: Arc::new(MemoryKnownHosts::new()),
            host_key_prompt: Arc::new(RejectUnknownHosts),
        }
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigProvider>) -> Self {
        self.config = config;
        self
    }

    pub fn with_local_fs(mut self, local: Arc<dyn LocalFilesystem>) -> Self {
        self.local = local;
        self
    }

    pub fn with_known_hosts(mut self, known_hosts: Arc<dyn KnownHosts>) -> Self {
        self.known_hosts = known_hosts;
        self
    }

    pub fn with_host_key_prompt(mut self, prompt: Arc<dyn HostKeyPrompt>) -> Self {
        self.host_key_prompt = prompt;
        self
    }

    pub(crate) fn connect_context(&self, config: &EngineConfig) -> ConnectContext {
        ConnectContext {
            timeout: config.timeout(),
            keepalive: config.keepalive(),
            known_hosts: self.known_hosts.clone(),
            host_key_prompt: self.host_key_prompt.clone(),
        }
    }
}

// ── Shared scheduler state ───────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, TransferJob>,
    /// Queued jobs by enqueue sequence.
    ready: BTreeMap<u64, JobId>,
    /// Earliest dispatch time of jobs waiting out a retry backoff.
    not_before: HashMap<JobId, Instant>,
    active: usize,
    next_seq: u64,
    stopping: bool,
}

enum Pass {
    /// Nothing dispatchable until something changes.
    Idle,
    /// A backed-off job becomes eligible at this instant.
    Until(Instant),
    Exit,
}

struct Shared {
    deps: EngineDeps,
    pool: Arc<SessionPool>,
    bus: EventBus,
    state: Mutex<QueueState>,
    /// Dispatcher wake-up.
    wake: Notify,
    /// A worker finished.
    settled: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start every job that is due while slots are free.
    fn dispatch_ready(self: &Arc<Self>) -> Pass {
        let config = self.deps.config.current();
        let mut guard = self.state();
        let state = &mut *guard;
        if state.stopping {
            return Pass::Exit;
        }
        // An invalid snapshot still dispatches one job at a time; the
        // worker then fails it with the validation error.
        let slots = config.max_concurrent.max(1);
        let now = Instant::now();
        while state.active < slots {
            let due = state.ready.iter().find_map(|(&seq, id)| {
                match state.not_before.get(id) {
                    Some(at) if *at > now => None,
                    _ => Some((seq, *id)),
                }
            });
            let Some((seq, id)) = due else { break };
            state.ready.remove(&seq);
            state.not_before.remove(&id);
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if let Err(e) = job.transition(JobState::Active) {
                tracing::error!(job_id = %id, error = %e, "dispatch skipped");
                continue;
            }
            state.active += 1;
            tracing::info!(
                job_id = %id,
                attempt = job.attempt,
                active = state.active,
                "job dispatched"
            );
            self.bus.emit(
                id,
                EventKind::StateChanged {
                    state: JobState::Active,
                },
            );
            self.spawn_worker(
                Attempt {
                    id,
                    request: job.request.clone(),
                    attempt: job.attempt,
                    cancel: job.cancel.clone(),
                },
                config.clone(),
            );
        }
        if state.active >= slots {
            return Pass::Idle;
        }
        match state
            .ready
            .values()
            .filter_map(|id| state.not_before.get(id).copied())
            .min()
        {
            Some(at) => Pass::Until(at),
            None => Pass::Idle,
        }
    }

    fn spawn_worker(self: &Arc<Self>, attempt: Attempt, config: EngineConfig) {
        let shared = self.clone();
        tokio::spawn(async move {
            let id = attempt.id;
            let run = {
                let shared = shared.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    run_attempt(&shared.deps, &shared.pool, &config, &attempt, shared.as_ref()).await
                })
            };
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let what = if e.is_panic() { "panicked" } else { "was aborted" };
                    tracing::error!(job_id = %id, error = ?e, "transfer worker {}", what);
                    AttemptOutcome::Failed(TransferError::protocol(format!(
                        "transfer worker {}",
                        what
                    )))
                }
            };
            shared.finish(id, outcome, &config);
        });
    }

    /// Apply a worker's outcome to its job.
    fn finish(&self, id: JobId, outcome: AttemptOutcome, config: &EngineConfig) {
        {
            let mut guard = self.state();
            let state = &mut *guard;
            state.active = state.active.saturating_sub(1);
            let stopping = state.stopping;
            if let Some(job) = state.jobs.get_mut(&id) {
                match outcome {
                    AttemptOutcome::Completed { bytes } => {
                        if job.total_bytes.is_none() {
                            job.total_bytes = Some(bytes);
                        }
                        job.record_progress(bytes);
                        self.settle(job, JobState::Completed);
                    }
                    AttemptOutcome::Stopped(reason) => {
                        job.paused = reason == StopReason::Pause;
                        self.settle(job, JobState::Cancelled);
                    }
                    AttemptOutcome::Failed(error) => {
                        let stop = job.cancel.reason();
                        let decision = if stop.is_some() || stopping {
                            RetryDecision::Fail
                        } else {
                            RetryManager::from_config(config).decide(job.attempt, &error)
                        };
                        job.last_error = Some(error.clone());
                        match decision {
                            RetryDecision::Retry { attempt, delay } => {
                                job.attempt = attempt;
                                tracing::warn!(
                                    job_id = %id,
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %error,
                                    "retrying after backoff"
                                );
                                self.bus.emit(
                                    id,
                                    EventKind::Error {
                                        error,
                                        will_retry: true,
                                    },
                                );
                                self.settle(job, JobState::Queued);
                                state.ready.insert(job.seq, id);
                                state.not_before.insert(id, Instant::now() + delay);
                            }
                            RetryDecision::Fail => {
                                self.bus.emit(
                                    id,
                                    EventKind::Error {
                                        error,
                                        will_retry: false,
                                    },
                                );
                                match stop {
                                    Some(reason) => {
                                        job.paused = reason == StopReason::Pause;
                                        self.settle(job, JobState::Cancelled);
                                    }
                                    None => self.settle(job, JobState::Failed),
                                }
                            }
                        }
                    }
                }
            }
        }
        self.wake.notify_one();
        self.settled.notify_waiters();
    }

    fn settle(&self, job: &mut TransferJob, next: JobState) {
        match job.transition(next) {
            Ok(()) => {
                tracing::info!(
                    job_id = %job.id,
                    state = %next,
                    transferred = job.transferred_bytes,
                    attempt = job.attempt,
                    "job state changed"
                );
                self.bus.emit(job.id, EventKind::StateChanged { state: next });
            }
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "state change rejected"),
        }
    }

    fn stop(&self, id: JobId, reason: StopReason) -> TransferResult<JobState> {
        let mut guard = self.state();
        let state = &mut *guard;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| TransferError::invalid_job(format!("unknown job {}", id)))?;
        match job.state {
            JobState::Queued => {
                job.cancel.request(reason);
                job.paused = reason == StopReason::Pause;
                state.ready.remove(&job.seq);
                state.not_before.remove(&id);
                self.settle(job, JobState::Cancelled);
                Ok(JobState::Cancelled)
            }
            JobState::Active => {
                if job.cancel.request(reason) {
                    tracing::info!(job_id = %id, ?reason, "stop requested");
                }
                Ok(JobState::Active)
            }
            terminal => Ok(terminal),
        }
    }
}

impl JobReporter for Shared {
    fn started(&self, id: JobId, total: Option<u64>, offset: u64, granularity: u8) {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        job.total_bytes = total;
        job.resume_offset = offset;
        job.transferred_bytes = total.map_or(offset, |t| offset.min(t));
        // Only bytes kept from an earlier attempt count as announced.
        if let Some(t) = total.filter(|_| offset > 0) {
            let already = percent_of(job.transferred_bytes, t);
            let step = granularity.max(1);
            job.last_milestone = job.last_milestone.max(already - already % step);
        }
    }

    fn progress(&self, id: JobId, transferred: u64, granularity: u8) {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        job.record_progress(transferred);
        let percent = job.percent();
        let bytes = job.transferred_bytes;
        self.bus.emit(
            id,
            EventKind::Progress {
                bytes,
                total: job.total_bytes,
                percent,
            },
        );
        if let Some(p) = percent {
            for milestone in crossed_milestones(job.last_milestone, p, granularity) {
                job.last_milestone = milestone;
                self.bus.emit(
                    id,
                    EventKind::Milestone {
                        bytes,
                        percent: milestone,
                    },
                );
            }
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        let woken = shared.wake.notified();
        match shared.dispatch_ready() {
            Pass::Exit => break,
            Pass::Idle => woken.await,
            Pass::Until(at) => {
                tokio::select! {
                    _ = woken => {}
                    _ = time::sleep_until(at) => {}
                }
            }
        }
    }
    tracing::debug!("dispatcher stopped");
}

// ── Public surface ───────────────────────────────────────────────────

/// The transfer engine. Must be started inside a tokio runtime.
pub struct TransferQueue {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl TransferQueue {
    pub fn start(deps: EngineDeps) -> Self {
        let config = deps.config.current();
        let pool = SessionPool::new(deps.factory.clone());
        let config_source = deps.config.clone();
        let maintenance = spawn_pool_maintenance(
            &pool,
            config.keepalive().max(Duration::from_secs(1)),
            move || config_source.current().session_idle_timeout(),
        );
        let shared = Arc::new(Shared {
            deps,
            pool,
            bus: EventBus::new(EVENT_CAPACITY),
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            settled: Notify::new(),
        });
        let dispatcher = tokio::spawn(dispatch_loop(shared.clone()));
        tracing::info!(
            max_concurrent = config.max_concurrent,
            max_retries = config.max_retries,
            chunk_size = config.chunk_size,
            "transfer engine started"
        );
        Self {
            shared,
            dispatcher,
            maintenance,
        }
    }

    /// Admit a job. Returns at once; the job starts `Queued`.
    pub fn enqueue(&self, request: TransferRequest) -> TransferResult<JobId> {
        request.validate()?;
        let id = {
            let mut guard = self.shared.state();
            let state = &mut *guard;
            if state.stopping {
                return Err(TransferError::invalid_job("engine is shutting down"));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let job = TransferJob::new(seq, request);
            let id = job.id;
            tracing::info!(
                job_id = %id,
                direction = ?job.request.direction,
                source = %job.request.source(),
                dest = %job.request.destination(),
                "job queued"
            );
            state.ready.insert(seq, id);
            state.jobs.insert(id, job);
            self.shared.bus.emit(
                id,
                EventKind::StateChanged {
                    state: JobState::Queued,
                },
            );
            id
        };
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Cooperative cancel. A queued job is cancelled immediately; an active
    /// one stops at its next chunk boundary. Terminal jobs are left alone
    /// and their state is returned.
    pub fn cancel(&self, id: JobId) -> TransferResult<JobState> {
        self.shared.stop(id, StopReason::Cancel)
    }

    /// Like [`cancel`](Self::cancel) but the partial destination is always
    /// kept and the job is marked paused.
    pub fn pause(&self, id: JobId) -> TransferResult<JobState> {
        self.shared.stop(id, StopReason::Pause)
    }

    /// Enqueue a fresh job for the same transfer as a cancelled or failed
    /// one. The new job resumes from the partial destination.
    pub fn resume(&self, id: JobId) -> TransferResult<JobId> {
        let request = {
            let state = self.shared.state();
            let job = state
                .jobs
                .get(&id)
                .ok_or_else(|| TransferError::invalid_job(format!("unknown job {}", id)))?;
            match job.state {
                JobState::Cancelled | JobState::Failed => job.request.clone(),
                JobState::Completed => {
                    return Err(TransferError::invalid_job(format!(
                        "job {} already completed",
                        id
                    )))
                }
                JobState::Queued | JobState::Active => {
                    return Err(TransferError::invalid_job(format!(
                        "job {} has not stopped yet",
                        id
                    )))
                }
            }
        };
        let new_id = self.enqueue(request)?;
        tracing::info!(job_id = %new_id, resumed_from = %id, "job resumed");
        Ok(new_id)
    }

    pub fn subscribe(&self) -> EventStream {
        self.shared.bus.subscribe()
    }

    /// Snapshots in enqueue order.
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.shared.state();
        let mut jobs: Vec<&TransferJob> = state.jobs.values().collect();
        jobs.sort_by_key(|j| j.seq);
        jobs.into_iter().map(TransferJob::snapshot).collect()
    }

    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        self.shared.state().jobs.get(&id).map(TransferJob::snapshot)
    }

    pub fn active_count(&self) -> usize {
        self.shared.state().active
    }

    /// Drop terminal jobs from the table; returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let mut state = self.shared.state();
        let before = state.jobs.len();
        state.jobs.retain(|_, job| !job.state.is_terminal());
        before - state.jobs.len()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Close every idle pooled session.
    pub async fn disconnect_all(&self) -> usize {
        self.shared.pool.disconnect_all().await
    }

    /// Expand a directory into one job per file and enqueue them.
    ///
    /// Destination directories are created up front. A root that turns out
    /// to be a plain file yields a single job.
    pub async fn enqueue_tree(
        &self,
        site_id: &str,
        direction: Direction,
        remote_root: &str,
        local_root: &Path,
    ) -> TransferResult<Vec<JobId>> {
        let probe = TransferRequest {
            site_id: site_id.to_string(),
            direction,
            remote_path: remote_root.to_string(),
            local_path: local_root.to_path_buf(),
        };
        probe.validate()?;

        let deps = &self.shared.deps;
        let config = deps.config.current();
        let (endpoint, auth) = deps.credentials.resolve(site_id).await?;
        let ctx = deps.connect_context(&config);
        let mut lease = self
            .shared
            .pool
            .acquire(site_id, &endpoint, &auth, &ctx, config.max_sessions_per_endpoint)
            .await?;
        let planned = match lease.session() {
            Ok(session) => match direction {
                Direction::Download => {
                    plan_download_tree(session, deps.local.as_ref(), &probe).await
                }
                Direction::Upload => plan_upload_tree(session, deps.local.as_ref(), &probe).await,
            },
            Err(e) => Err(e),
        };
        lease.release(planned.as_ref().err()).await;
        let requests = planned?;
        tracing::info!(
            site = site_id,
            root = remote_root,
            files = requests.len(),
            "directory expanded"
        );
        requests.into_iter().map(|r| self.enqueue(r)).collect()
    }

    /// Stop dispatching, cancel queued and active jobs, wait for workers to
    /// wind down and close the session pool.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.shared.state();
            let state = &mut *guard;
            state.stopping = true;
            let queued: Vec<JobId> = state.ready.values().copied().collect();
            state.ready.clear();
            state.not_before.clear();
            for id in queued {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.cancel.request(StopReason::Shutdown);
                    self.shared.settle(job, JobState::Cancelled);
                }
            }
            for job in state.jobs.values() {
                if job.state == JobState::Active {
                    job.cancel.request(StopReason::Shutdown);
                }
            }
        }
        self.shared.wake.notify_one();
        loop {
            let settled = self.shared.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if self.shared.state().active == 0 {
                break;
            }
            settled.await;
        }
        self.shared.pool.shutdown().await;
        self.maintenance.abort();
        tracing::info!("transfer engine stopped");
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.maintenance.abort();
    }
}

// ── Directory expansion ──────────────────────────────────────────────

async fn plan_download_tree(
    session: &mut dyn ProtocolSession,
    local: &dyn LocalFilesystem,
    root: &TransferRequest,
) -> TransferResult<Vec<TransferRequest>> {
    if !session.stat(&root.remote_path).await?.is_dir() {
        return Ok(vec![root.clone()]);
    }
    let mut requests = Vec::new();
    let mut pending = VecDeque::from([(root.remote_path.clone(), root.local_path.clone())]);
    while let Some((remote_dir, local_dir)) = pending.pop_front() {
        local.create_dir_all(&local_dir).await?;
        let mut entries = session.list(&remote_dir).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in entries {
            let remote = join_remote(&remote_dir, &entry.name);
            let local_path = local_dir.join(&entry.name);
            match entry.kind {
                pkd_core::EntryKind::Directory => pending.push_back((remote, local_path)),
                pkd_core::EntryKind::File => requests.push(TransferRequest::download(
                    root.site_id.clone(),
                    remote,
                    local_path,
                )),
                other => tracing::debug!(path = %remote, kind = ?other, "skipping entry"),
            }
        }
    }
    Ok(requests)
}

fn remote_path_for(root: &str, rel: &Path) -> String {
    rel.components().fold(root.to_string(), |dir, part| {
        join_remote(&dir, &part.as_os_str().to_string_lossy())
    })
}

async fn ensure_remote_dir(session: &mut dyn ProtocolSession, path: &str) -> TransferResult<()> {
    match session.stat(path).await {
        Ok(entry) if entry.is_dir() => Ok(()),
        Ok(_) => Err(TransferError::invalid_job(format!(
            "{} exists and is not a directory",
            path
        ))),
        Err(e) if e.kind == ErrorKind::NotFound => session.mkdir(path).await,
        Err(e) => Err(e),
    }
}

async fn plan_upload_tree(
    session: &mut dyn ProtocolSession,
    local: &dyn LocalFilesystem,
    root: &TransferRequest,
) -> TransferResult<Vec<TransferRequest>> {
    let stat = local.stat(&root.local_path).await?.ok_or_else(|| {
        TransferError::invalid_path(format!("{} does not exist", root.local_path.display()))
    })?;
    if !stat.is_dir {
        return Ok(vec![root.clone()]);
    }
    let files = local.walk_files(&root.local_path).await?;

    // Parents sort before their children.
    let mut dirs = BTreeSet::new();
    for rel in &files {
        if let Some(parent) = rel.parent() {
            for ancestor in parent.ancestors().filter(|a| !a.as_os_str().is_empty()) {
                dirs.insert(remote_path_for(&root.remote_path, ancestor));
            }
        }
    }
    ensure_remote_dir(session, &root.remote_path).await?;
    for dir in &dirs {
        ensure_remote_dir(session, dir).await?;
    }

    Ok(files
        .iter()
        .map(|rel| {
            TransferRequest::upload(
                root.site_id.clone(),
                root.local_path.join(rel),
                remote_path_for(&root.remote_path, rel),
            )
        })
        .collect::<Vec<_>>())
}
