//! Bounded hand-off from browser event producers to the recorder.
//!
//! Producers hold cheap [`EventSink`] clones. One OS thread drains the
//! queue and performs the durable append, so fsync never runs on a runtime
//! worker and per-producer order is kept.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use rewind_log::EventPayload;
use rewind_log::Recorder;
use rewind_log::TabId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::LifecycleError;
use crate::session::TabTable;

/// What a producer experiences when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// The producer waits for capacity.
    #[default]
    Block,
    /// The incoming event is discarded and counted.
    DropNewest,
}

impl std::str::FromStr for Backpressure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Backpressure::Block),
            "drop" | "drop_newest" | "drop-newest" => Ok(Backpressure::DropNewest),
            other => Err(format!("unknown backpressure policy '{}'", other)),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
    #[error("Ingest queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    Queued,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub accepted: u64,
    pub dropped: u64,
    pub appended: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    appended: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            appended: self.appended.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

enum Message {
    Event(TabId, EventPayload),
    Close,
}

/// Producer handle for captured events.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Message>,
    policy: Backpressure,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn policy(&self) -> Backpressure {
        self.policy
    }

    /// Queues one event under the configured policy.
    pub async fn emit(&self, tab: TabId, event: EventPayload) -> Result<Emitted, IngestError> {
        match self.policy {
            Backpressure::Block => {
                if self.closed.load(Ordering::Acquire) {
                    return Err(IngestError::Closed);
                }
                self.tx
                    .send(Message::Event(tab, event))
                    .await
                    .map_err(|_| IngestError::Closed)?;
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(Emitted::Queued)
            }
            Backpressure::DropNewest => self.try_emit(tab, event),
        }
    }

    /// Queues one event without waiting; a full queue drops it.
    pub fn try_emit(&self, tab: TabId, event: EventPayload) -> Result<Emitted, IngestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IngestError::Closed);
        }
        match self.tx.try_send(Message::Event(tab, event)) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(Emitted::Queued)
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(tab = %tab, dropped, "Ingest queue full, dropping newest event");
                }
                Ok(Emitted::Dropped)
            }
            Err(TrySendError::Closed(_)) => Err(IngestError::Closed),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }
}

fn channel(capacity: usize, policy: Backpressure) -> (EventSink, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = EventSink {
        tx,
        policy,
        counters: Arc::new(Counters::default()),
        closed: Arc::new(AtomicBool::new(false)),
    };
    (sink, rx)
}

/// The queue plus its consumer thread.
pub struct Ingest {
    sink: EventSink,
    consumer: Option<JoinHandle<()>>,
}

impl Ingest {
    pub fn start(
        recorder: Arc<Recorder>,
        tabs: Arc<TabTable>,
        capacity: usize,
        policy: Backpressure,
    ) -> Result<Self, LifecycleError> {
        let (sink, rx) = channel(capacity, policy);
        let counters = Arc::clone(&sink.counters);
        let consumer = std::thread::Builder::new()
            .name("rewind-ingest".to_string())
            .spawn(move || consume(rx, &recorder, &tabs, &counters))
            .map_err(|e| LifecycleError::Task(format!("failed to spawn ingest thread: {}", e)))?;
        debug!(capacity, ?policy, "Ingest queue started");
        Ok(Self {
            sink,
            consumer: Some(consumer),
        })
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn stats(&self) -> IngestStats {
        self.sink.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.consumer.is_none()
    }

    /// Rejects new events, drains everything already accepted into the
    /// recorder, syncs it and joins the consumer. Idempotent.
    pub async fn close(&mut self) -> Result<IngestStats, LifecycleError> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(self.stats());
        };
        self.sink.closed.store(true, Ordering::Release);
        // Queued behind any pending events, so it is seen last.
        let _ = self.sink.tx.send(Message::Close).await;
        tokio::task::spawn_blocking(move || consumer.join())
            .await
            .map_err(|e| LifecycleError::Task(e.to_string()))?
            .map_err(|_| LifecycleError::Task("ingest thread panicked".to_string()))?;
        let stats = self.stats();
        info!(
            appended = stats.appended,
            dropped = stats.dropped,
            failed = stats.failed,
            "Ingest queue closed"
        );
        Ok(stats)
    }
}

fn consume(
    mut rx: mpsc::Receiver<Message>,
    recorder: &Recorder,
    tabs: &TabTable,
    counters: &Counters,
) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            Message::Event(tab, event) => match recorder.append(tab, &event) {
                Ok(_) => {
                    tabs.observe(tab, &event);
                    counters.appended.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(tab = %tab, error = %e, "Failed to record event");
                }
            },
            // Anything already buffered is still received after close().
            Message::Close => rx.close(),
        }
    }
    if let Err(e) = recorder.sync() {
        warn!(error = %e, "Failed to sync recording on ingest close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_log::SyncPolicy;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn event(ts: i64) -> EventPayload {
        EventPayload::new(json!({"type": 3, "timestamp": ts}))
    }

    #[test]
    fn test_backpressure_from_str() {
        assert_eq!("block".parse::<Backpressure>().unwrap(), Backpressure::Block);
        assert_eq!("DROP".parse::<Backpressure>().unwrap(), Backpressure::DropNewest);
        assert!("spill".parse::<Backpressure>().is_err());
    }

    #[tokio::test]
    async fn test_drop_newest_discards_when_full() {
        let (sink, mut rx) = channel(2, Backpressure::DropNewest);
        assert_eq!(sink.emit(TabId(0), event(1)).await, Ok(Emitted::Queued));
        assert_eq!(sink.emit(TabId(0), event(2)).await, Ok(Emitted::Queued));
        assert_eq!(sink.emit(TabId(0), event(3)).await, Ok(Emitted::Dropped));
        assert_eq!(sink.try_emit(TabId(0), event(4)), Ok(Emitted::Dropped));

        let stats = sink.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.dropped, 2);

        // The survivors are the oldest two, in order.
        for expected in [1, 2] {
            match rx.recv().await {
                Some(Message::Event(_, e)) => assert_eq!(e.timestamp(), Some(expected)),
                _ => panic!("expected an event"),
            }
        }
    }

    #[tokio::test]
    async fn test_block_waits_for_capacity() {
        let (sink, mut rx) = channel(1, Backpressure::Block);
        sink.emit(TabId(0), event(1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), sink.emit(TabId(0), event(2)));
        assert!(blocked.await.is_err(), "second emit should wait for capacity");

        let producer = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.emit(TabId(0), event(3)).await })
        };
        assert!(matches!(rx.recv().await, Some(Message::Event(..))));
        assert_eq!(producer.await.unwrap(), Ok(Emitted::Queued));
        assert_eq!(sink.stats().dropped, 0);
    }

    #[tokio::test]
    async fn test_close_drains_accepted_events_into_recorder() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::open(dir.path(), SyncPolicy::Flush).unwrap());
        let tabs = Arc::new(TabTable::default());
        let mut ingest =
            Ingest::start(Arc::clone(&recorder), Arc::clone(&tabs), 8, Backpressure::Block)
                .unwrap();
        let sink = ingest.sink();

        for ts in 0..100 {
            sink.emit(TabId((ts % 2) as u32), event(1_000 + ts)).await.unwrap();
        }
        let stats = ingest.close().await.unwrap();
        assert_eq!(stats.appended, 100);
        assert_eq!(recorder.stats().records, 100);
        assert_eq!(tabs.len(), 2);

        assert_eq!(sink.emit(TabId(0), event(5_000)).await, Err(IngestError::Closed));
        assert_eq!(ingest.close().await.unwrap().appended, 100);
    }

    #[tokio::test]
    async fn test_rejected_events_are_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::open(dir.path(), SyncPolicy::Flush).unwrap());
        let mut ingest = Ingest::start(
            Arc::clone(&recorder),
            Arc::new(TabTable::default()),
            4,
            Backpressure::Block,
        )
        .unwrap();
        let sink = ingest.sink();
        sink.emit(TabId(0), EventPayload::new(json!({"type": 3})))
            .await
            .unwrap();
        sink.emit(TabId(0), event(10)).await.unwrap();

        let stats = ingest.close().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.appended, 1);
        assert_eq!(recorder.stats().records, 1);
    }
}
