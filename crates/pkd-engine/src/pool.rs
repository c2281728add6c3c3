//! Session pool: reuses authenticated sessions across jobs that target the
//! same endpoint with the same credentials, with idle reaping and keepalive.

use pkd_core::{
    AuthMaterial, ConnectContext, Endpoint, ErrorCategory, ProtocolSession, SessionFactory,
    TransferError, TransferResult,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// Sessions are shared only between jobs with the same endpoint and site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub endpoint: String,
    pub site: String,
}

impl PoolKey {
    pub fn new(endpoint: &Endpoint, site: &str) -> Self {
        Self {
            endpoint: endpoint.key(),
            site: site.to_string(),
        }
    }
}

struct IdleSession {
    session: Box<dyn ProtocolSession>,
    since: Instant,
}

#[derive(Default)]
struct Bucket {
    idle: Vec<IdleSession>,
    /// Sessions alive for this key: idle, leased or connecting.
    live: usize,
}

enum Step {
    Reuse(Box<dyn ProtocolSession>),
    Connect,
    Wait,
}

#[derive(Default)]
struct PoolState {
    buckets: HashMap<PoolKey, Bucket>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub keys: usize,
    pub live_sessions: usize,
    pub idle_sessions: usize,
}

pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    state: Mutex<PoolState>,
    /// Signalled whenever a slot frees up or a session is returned.
    released: Notify,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Hand out an idle session for `(endpoint, site)`, connect a new one if
    /// the key is below `max_per_key`, or wait for one to be released.
    pub async fn acquire(
        self: &Arc<Self>,
        site: &str,
        endpoint: &Endpoint,
        auth: &AuthMaterial,
        ctx: &ConnectContext,
        max_per_key: usize,
    ) -> TransferResult<SessionLease> {
        let key = PoolKey::new(endpoint, site);
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let step = {
                let mut state = self.state();
                if state.closed {
                    return Err(TransferError::cancelled());
                }
                let bucket = state.buckets.entry(key.clone()).or_default();
                let mut reused = None;
                while let Some(idle) = bucket.idle.pop() {
                    if idle.session.is_reusable() {
                        reused = Some(idle.session);
                        break;
                    }
                    bucket.live = bucket.live.saturating_sub(1);
                }
                match reused {
                    Some(session) => Step::Reuse(session),
                    None if bucket.live < max_per_key.max(1) => {
                        bucket.live += 1;
                        Step::Connect
                    }
                    None => {
                        tracing::debug!(
                            endpoint = %endpoint.key(),
                            live = bucket.live,
                            "endpoint at session limit, waiting"
                        );
                        Step::Wait
                    }
                }
            };

            match step {
                Step::Reuse(session) => {
                    tracing::debug!(endpoint = %endpoint.key(), "reusing pooled session");
                    return Ok(SessionLease {
                        pool: self.clone(),
                        key,
                        session: Some(session),
                    });
                }
                Step::Wait => {
                    released.await;
                    continue;
                }
                Step::Connect => {}
            }

            let slot = SlotGuard {
                pool: self,
                key: &key,
                armed: true,
            };
            let session = self.factory.connect(endpoint, auth, ctx).await?;
            slot.disarm();
            tracing::info!(endpoint = %endpoint.key(), "session opened");
            return Ok(SessionLease {
                pool: self.clone(),
                key,
                session: Some(session),
            });
        }
    }

    fn forget(&self, key: &PoolKey) {
        {
            let mut state = self.state();
            if let Some(bucket) = state.buckets.get_mut(key) {
                bucket.live = bucket.live.saturating_sub(1);
            }
        }
        self.released.notify_waiters();
    }

    fn give_back(&self, key: &PoolKey, session: Box<dyn ProtocolSession>) -> Option<Box<dyn ProtocolSession>> {
        let rejected = {
            let mut state = self.state();
            if state.closed {
                Some(session)
            } else {
                let bucket = state.buckets.entry(key.clone()).or_default();
                bucket.idle.push(IdleSession {
                    session,
                    since: Instant::now(),
                });
                None
            }
        };
        if rejected.is_none() {
            self.released.notify_waiters();
        }
        rejected
    }

    /// Close sessions idle for longer than `idle_timeout`.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let expired = self.take_idle(|idle| idle.since.elapsed() >= idle_timeout);
        let count = expired.len();
        for (key, mut session) in expired {
            let _ = session.close().await;
            self.forget(&key);
        }
        if count > 0 {
            tracing::info!(count, "reaped idle sessions");
        }
        count
    }

    /// Keepalive round-trip on every idle session. Sessions that fail it are
    /// closed.
    pub async fn keepalive_all(&self) {
        let idle = self.take_idle(|_| true);
        for (key, mut session) in idle {
            match session.keepalive().await {
                Ok(()) if session.is_reusable() => {
                    if let Some(mut session) = self.give_back(&key, session) {
                        let _ = session.close().await;
                        self.forget(&key);
                    }
                }
                outcome => {
                    if let Err(e) = outcome {
                        tracing::warn!(endpoint = %key.endpoint, error = %e, "keepalive failed");
                    }
                    let _ = session.close().await;
                    self.forget(&key);
                }
            }
        }
    }

    /// Close every idle session. Leased sessions are closed when returned.
    pub async fn disconnect_all(&self) -> usize {
        let idle = self.take_idle(|_| true);
        let count = idle.len();
        for (key, mut session) in idle {
            let _ = session.close().await;
            self.forget(&key);
        }
        if count > 0 {
            tracing::info!(count, "disconnected idle sessions");
        }
        count
    }

    /// Refuse new leases, wake waiters and close idle sessions.
    pub async fn shutdown(&self) {
        self.state().closed = true;
        self.released.notify_waiters();
        self.disconnect_all().await;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            keys: state.buckets.values().filter(|b| b.live > 0).count(),
            live_sessions: state.buckets.values().map(|b| b.live).sum(),
            idle_sessions: state.buckets.values().map(|b| b.idle.len()).sum(),
        }
    }

    fn take_idle(
        &self,
        mut pick: impl FnMut(&IdleSession) -> bool,
    ) -> Vec<(PoolKey, Box<dyn ProtocolSession>)> {
        let mut state = self.state();
        let mut taken = Vec::new();
        for (key, bucket) in state.buckets.iter_mut() {
            let (out, keep): (Vec<_>, Vec<_>) = bucket.idle.drain(..).partition(|i| pick(i));
            bucket.idle = keep;
            taken.extend(out.into_iter().map(|i| (key.clone(), i.session)));
        }
        taken
    }
}

/// Releases a reserved connect slot if the connect fails or is abandoned.
struct SlotGuard<'a> {
    pool: &'a SessionPool,
    key: &'a PoolKey,
    armed: bool,
}

impl SlotGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.forget(self.key);
        }
    }
}

/// Exclusive use of one pooled session. Return it with [`release`]; a lease
/// that is dropped instead discards its session.
///
/// [`release`]: SessionLease::release
pub struct SessionLease {
    pool: Arc<SessionPool>,
    key: PoolKey,
    session: Option<Box<dyn ProtocolSession>>,
}

impl SessionLease {
    pub fn session(&mut self) -> TransferResult<&mut (dyn ProtocolSession + 'static)> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| TransferError::protocol("session lease already released"))
    }

    /// Return the session to the pool, or close it if the last operation
    /// failed at the connection level or left it unusable.
    pub async fn release(mut self, outcome: Option<&TransferError>) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let broken = outcome.is_some_and(|e| e.category() == ErrorCategory::Connection);
        if broken || !session.is_reusable() {
            tracing::debug!(endpoint = %self.key.endpoint, "closing session");
            let _ = session.close().await;
            self.pool.forget(&self.key);
            return;
        }
        if let Some(mut session) = self.pool.give_back(&self.key, session) {
            let _ = session.close().await;
            self.pool.forget(&self.key);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            self.pool.forget(&self.key);
        }
    }
}

/// Spawn a background task that periodically reaps idle sessions and sends
/// keepalives. The task ends once the pool is dropped or shut down.
pub fn spawn_pool_maintenance(
    pool: &Arc<SessionPool>,
    interval: Duration,
    idle_timeout: impl Fn() -> Duration + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    let weak: Weak<SessionPool> = Arc::downgrade(pool);
    let period = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = weak.upgrade() else { break };
            if pool.state().closed {
                break;
            }
            pool.reap_idle(idle_timeout()).await;
            pool.keepalive_all().await;
        }
    })
}
