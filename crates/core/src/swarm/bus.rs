//! # Progress Event Bus
//!
//! Per-run fan-out of [`PipelineEvent`]s to bounded subscriber queues.
//! Publishing never blocks: a full queue loses the event for that subscriber
//! only, a closed queue is pruned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::events::PipelineEvent;
use super::phases::RunSnapshot;

/// Default queue length per subscriber
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

/// A live subscription to one run
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub run_id: String,
    pub rx: mpsc::Receiver<PipelineEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }
}

type Subscribers = HashMap<String, Vec<(u64, mpsc::Sender<PipelineEvent>)>>;

/// Broadcast bus keyed by run id
pub struct EventBus {
    subscribers: Mutex<Subscribers>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to a run. The first queued event is the snapshot returned
    /// by `snapshot`, taken under the bus lock so no later event is missed.
    /// A run that already ended yields the snapshot and then a closed queue.
    pub fn subscribe<F>(&self, run_id: &str, snapshot: F) -> Subscription
    where
        F: FnOnce() -> RunSnapshot,
    {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.lock();
        let current = snapshot();
        let terminal = current.status.is_terminal();
        // Fresh queue with capacity >= 1
        let _ = tx.try_send(PipelineEvent::state(&current));

        if !terminal {
            subscribers
                .entry(run_id.to_string())
                .or_default()
                .push((id, tx));
        }

        tracing::debug!(run_id, subscriber = id, terminal, "subscriber attached");
        Subscription {
            id,
            run_id: run_id.to_string(),
            rx,
        }
    }

    /// Detach a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, run_id: &str, subscriber_id: u64) {
        let mut subscribers = self.lock();
        if let Some(list) = subscribers.get_mut(run_id) {
            list.retain(|(id, _)| *id != subscriber_id);
            if list.is_empty() {
                subscribers.remove(run_id);
            }
        }
    }

    /// Deliver an event to every subscriber of its run without waiting
    pub fn emit(&self, event: PipelineEvent) {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(&event.run_id) else {
            return;
        };

        list.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    run_id = %event.run_id,
                    subscriber = id,
                    kind = event.kind.as_str(),
                    "subscriber queue full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if list.is_empty() {
            subscribers.remove(&event.run_id);
        }
    }

    /// Drop every subscriber of a run, ending their streams
    pub fn close(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.lock().get(run_id).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::events::PipelineEventKind;
    use crate::swarm::phases::{Run, RunStatus};

    fn snapshot(run_id: &str) -> RunSnapshot {
        let mut run = Run::new(run_id.to_string(), 1);
        run.start();
        run.snapshot()
    }

    #[tokio::test]
    async fn test_snapshot_is_first_event() {
        let bus = EventBus::default();
        bus.emit(PipelineEvent::new(PipelineEventKind::RunStarted, "prun_a"));

        let mut sub = bus.subscribe("prun_a", || snapshot("prun_a"));
        bus.emit(PipelineEvent::new(PipelineEventKind::PhaseStarted, "prun_a"));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, PipelineEventKind::State);
        assert_eq!(first.data.unwrap()["status"], "running");
        assert_eq!(sub.recv().await.unwrap().kind, PipelineEventKind::PhaseStarted);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe("prun_b", || snapshot("prun_b"));
        let mut fast = bus.subscribe("prun_b", || snapshot("prun_b"));
        assert_eq!(fast.recv().await.unwrap().kind, PipelineEventKind::State);

        for _ in 0..5 {
            bus.emit(PipelineEvent::new(PipelineEventKind::TaskCompleted, "prun_b"));
            // Keep the fast subscriber drained
            fast.recv().await.unwrap();
        }

        // Snapshot plus one event fit; the rest were dropped
        assert_eq!(slow.recv().await.unwrap().kind, PipelineEventKind::State);
        assert_eq!(slow.recv().await.unwrap().kind, PipelineEventKind::TaskCompleted);
        assert!(slow.rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count("prun_b"), 2);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let bus = EventBus::default();
        let sub = bus.subscribe("prun_c", || snapshot("prun_c"));
        let other = bus.subscribe("prun_c", || snapshot("prun_c"));
        drop(sub);

        bus.emit(PipelineEvent::new(PipelineEventKind::PhaseStarted, "prun_c"));
        assert_eq!(bus.subscriber_count("prun_c"), 1);

        bus.unsubscribe("prun_c", other.id);
        assert_eq!(bus.subscriber_count("prun_c"), 0);
    }

    #[tokio::test]
    async fn test_terminal_run_yields_snapshot_then_ends() {
        let bus = EventBus::default();
        let mut done = Run::new("prun_d".to_string(), 1);
        done.start();
        done.finish(RunStatus::Completed, None);

        let mut sub = bus.subscribe("prun_d", || done.snapshot());
        assert_eq!(sub.recv().await.unwrap().kind, PipelineEventKind::State);
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count("prun_d"), 0);
    }
}
