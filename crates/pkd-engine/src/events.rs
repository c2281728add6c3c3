//! Engine → collaborator event stream.
//!
//! Every subscriber gets its own ordered stream starting at the moment it
//! subscribed. Events from one job arrive in the order the job produced them.

use crate::job::{JobId, JobState};
use chrono::{DateTime, Utc};
use futures::Stream;
use pkd_core::TransferError;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    /// Emitted after every chunk.
    Progress {
        bytes: u64,
        total: Option<u64>,
        percent: Option<u8>,
    },
    /// Cumulative percent reached a multiple of the configured granularity.
    Milestone { bytes: u64, percent: u8 },
    StateChanged { state: JobState },
    /// A failure; `will_retry` tells whether the job goes back to the queue.
    Error {
        error: TransferError,
        will_retry: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Fan-out point for events. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, job_id: JobId, kind: EventKind) {
        tracing::trace!(job = %job_id, event = ?kind, "event");
        // No subscribers is fine.
        let _ = self.tx.send(TransferEvent {
            job_id,
            at: Utc::now(),
            kind,
        });
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.tx.subscribe()),
        }
    }
}

/// Per-subscriber event stream. Never ends while the engine is alive; a
/// subscriber that falls too far behind skips the events it missed.
pub struct EventStream {
    inner: BroadcastStream<TransferEvent>,
}

impl Stream for EventStream {
    type Item = TransferEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                    tracing::warn!(skipped = n, "event subscriber lagged");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Percent thresholds crossed between two progress readings.
///
/// `last` is the highest milestone already announced; the return value
/// lists every multiple of `granularity` in `(last, percent]`.
pub fn crossed_milestones(last: u8, percent: u8, granularity: u8) -> Vec<u8> {
    if granularity == 0 || percent <= last {
        return Vec::new();
    }
    let step = granularity as u16;
    let mut next = (last as u16 / step + 1) * step;
    let mut out = Vec::new();
    while next <= percent as u16 && next <= 100 {
        out.push(next as u8);
        next += step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn quarter_milestones() {
        assert_eq!(crossed_milestones(0, 10, 25), Vec::<u8>::new());
        assert_eq!(crossed_milestones(0, 30, 25), vec![25]);
        assert_eq!(crossed_milestones(25, 100, 25), vec![50, 75, 100]);
        assert_eq!(crossed_milestones(100, 100, 25), Vec::<u8>::new());
    }

    #[test]
    fn odd_granularity_stops_at_100() {
        assert_eq!(crossed_milestones(90, 100, 30), Vec::<u8>::new());
        assert_eq!(crossed_milestones(0, 100, 30), vec![30, 60, 90]);
        assert_eq!(crossed_milestones(0, 100, 100), vec![100]);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(16);
        let id = JobId::new();
        let mut early = bus.subscribe();
        bus.emit(
            id,
            EventKind::StateChanged {
                state: JobState::Queued,
            },
        );
        let mut late = bus.subscribe();
        bus.emit(
            id,
            EventKind::StateChanged {
                state: JobState::Active,
            },
        );

        let first = early.next().await.unwrap();
        assert_eq!(
            first.kind,
            EventKind::StateChanged {
                state: JobState::Queued
            }
        );
        let only = late.next().await.unwrap();
        assert_eq!(
            only.kind,
            EventKind::StateChanged {
                state: JobState::Active
            }
        );
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_instead_of_ending() {
        let bus = EventBus::new(2);
        let id = JobId::new();
        let mut sub = bus.subscribe();
        for bytes in 0..5u64 {
            bus.emit(
                id,
                EventKind::Progress {
                    bytes,
                    total: Some(5),
                    percent: None,
                },
            );
        }
        let next = sub.next().await.unwrap();
        assert!(matches!(next.kind, EventKind::Progress { bytes: 3, .. }));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = TransferEvent {
            job_id: JobId::new(),
            at: Utc::now(),
            kind: EventKind::Milestone {
                bytes: 10,
                percent: 25,
            },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "milestone");
        assert_eq!(json["percent"], 25);
        assert!(json.get("jobId").is_some());
    }
}
