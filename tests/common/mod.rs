#![allow(dead_code)]

use futures::StreamExt;
use pkd_core::{
    AuthMaterial, ConfigProvider, EngineConfig, Endpoint, HostKeyPrompt, KnownHosts, Protocol,
    StaticConfigProvider, StaticCredentials,
};
use pkd_engine::memory::{MemoryServer, MemorySessionFactory};
use portkeydrop::{EngineDeps, EventKind, EventStream, JobId, JobState, TransferEvent, TransferQueue};
use std::sync::Arc;
use std::time::Duration;

pub const SITE: &str = "mem";

pub struct Harness {
    pub server: Arc<MemoryServer>,
    pub queue: TransferQueue,
    pub events: EventStream,
    pub dir: tempfile::TempDir,
}

pub struct HarnessBuilder {
    config: EngineConfig,
    config_provider: Option<Arc<dyn ConfigProvider>>,
    protocol: Protocol,
    known_hosts: Option<Arc<dyn KnownHosts>>,
    prompt: Option<Arc<dyn HostKeyPrompt>>,
    server: Arc<MemoryServer>,
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        config: EngineConfig {
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 100,
            ..EngineConfig::default()
        },
        config_provider: None,
        protocol: Protocol::Ftp,
        known_hosts: None,
        prompt: None,
        server: MemoryServer::new(),
    }
}

impl HarnessBuilder {
    pub fn config(mut self, f: impl FnOnce(&mut EngineConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Use `provider` instead of a validated static snapshot of `config`.
    pub fn config_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.config_provider = Some(provider);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn known_hosts(mut self, known_hosts: Arc<dyn KnownHosts>) -> Self {
        self.known_hosts = Some(known_hosts);
        self
    }

    pub fn prompt(mut self, prompt: Arc<dyn HostKeyPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn server(&self) -> Arc<MemoryServer> {
        self.server.clone()
    }

    pub fn start(self) -> Harness {
        let credentials = StaticCredentials::new().with_site(
            SITE,
            Endpoint::new(self.protocol, "mem.local"),
            AuthMaterial::password("tester", "secret"),
        );
        let config = match self.config_provider {
            Some(provider) => provider,
            None => Arc::new(StaticConfigProvider::new(self.config).expect("valid test config")),
        };
        let mut deps = EngineDeps::new(
            Arc::new(MemorySessionFactory::new(self.server.clone())),
            Arc::new(credentials),
        )
        .with_config(config);
        if let Some(known_hosts) = self.known_hosts {
            deps = deps.with_known_hosts(known_hosts);
        }
        if let Some(prompt) = self.prompt {
            deps = deps.with_host_key_prompt(prompt);
        }
        let queue = TransferQueue::start(deps);
        let events = queue.subscribe();
        Harness {
            server: self.server,
            queue,
            events,
            dir: tempfile::tempdir().expect("temp dir"),
        }
    }
}

impl Harness {
    pub fn local(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    /// Next event for `id`, skipping other jobs' events.
    pub async fn next_for(&mut self, id: JobId) -> TransferEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), self.events.next())
                .await
                .expect("event within 10s")
                .expect("event stream open");
            if event.job_id == id {
                return event;
            }
        }
    }

    /// Every event for `id` up to and including its terminal state change.
    pub async fn until_terminal(&mut self, id: JobId) -> Vec<TransferEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_for(id).await;
            let done = matches!(event.kind, EventKind::StateChanged { state } if state.is_terminal());
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Every event of any job until all of `ids` are terminal.
    pub async fn until_all_terminal(&mut self, ids: &[JobId]) -> Vec<TransferEvent> {
        let mut seen = Vec::new();
        let mut open: Vec<JobId> = ids.to_vec();
        while !open.is_empty() {
            let event = tokio::time::timeout(Duration::from_secs(10), self.events.next())
                .await
                .expect("event within 10s")
                .expect("event stream open");
            if let EventKind::StateChanged { state } = event.kind {
                if state.is_terminal() {
                    open.retain(|id| *id != event.job_id);
                }
            }
            seen.push(event);
        }
        seen
    }
}

pub fn states(events: &[TransferEvent]) -> Vec<JobState> {
    events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::StateChanged { state } => Some(state),
            _ => None,
        })
        .collect()
}

pub fn milestones(events: &[TransferEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::Milestone { percent, .. } => Some(percent),
            _ => None,
        })
        .collect()
}

pub fn progress_count(events: &[TransferEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Progress { .. }))
        .count()
}

/// Deterministic non-repeating payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
