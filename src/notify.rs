use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::model::StationEvent;
use crate::observability;

pub const DEFAULT_OBSERVER_BUFFER: usize = 256;

struct Hub {
    observers: DashMap<u64, mpsc::Sender<StationEvent>>,
    next_id: AtomicU64,
    /// Held for the whole of a delivery so every observer sees one global order.
    sequencer: Mutex<Sequencer>,
    closed: AtomicBool,
}

/// Reorder buffer between commit completion and delivery.
///
/// Commits finish in seq order at the WAL but their callers publish whenever
/// they get around to it; a commit that shows up early waits here until every
/// smaller seq has been released.
struct Sequencer {
    next: u64,
    parked: BTreeMap<u64, Vec<StationEvent>>,
}

/// Fan-out of committed state changes to every connected observer.
///
/// Each observer owns a bounded queue. Publishing never waits: an observer
/// whose queue is full is dropped, its stream ends, and it is expected to
/// reconnect and re-read a snapshot.
#[derive(Clone)]
pub struct Broadcaster {
    hub: Arc<Hub>,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                observers: DashMap::new(),
                next_id: AtomicU64::new(1),
                sequencer: Mutex::new(Sequencer {
                    next: 1,
                    parked: BTreeMap::new(),
                }),
                closed: AtomicBool::new(false),
            }),
            buffer: buffer.max(1),
        }
    }

    /// Register an observer. After `shutdown` the returned stream is already finished.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.hub.closed.load(Ordering::Acquire) {
            self.hub.observers.insert(id, tx);
            metrics::gauge!(observability::OBSERVERS_ACTIVE).set(self.hub.observers.len() as f64);
        }
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.hub),
        }
    }

    /// Set the first seq to expect. Called once, before any commit is made.
    pub fn resume_at(&self, seq: u64) {
        let mut sequencer = self.lock_sequencer();
        if sequencer.parked.is_empty() {
            sequencer.next = seq;
        }
    }

    /// An empty outbox for commit `seq`. Its events are delivered when it is
    /// released or dropped, after those of every earlier seq.
    pub fn outbox(&self, seq: u64) -> Outbox {
        Outbox {
            seq: Some(seq),
            events: Vec::new(),
            broadcaster: Some(self.clone()),
        }
    }

    fn lock_sequencer(&self) -> MutexGuard<'_, Sequencer> {
        self.hub.sequencer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, seq: u64, events: Vec<StationEvent>) {
        let mut sequencer = self.lock_sequencer();
        if seq < sequencer.next {
            warn!(seq, next = sequencer.next, "seq released twice, ignoring");
            return;
        }
        sequencer.parked.insert(seq, events);
        loop {
            let next = sequencer.next;
            let Some(events) = sequencer.parked.remove(&next) else {
                break;
            };
            sequencer.next += 1;
            self.deliver(&events);
        }
        metrics::gauge!(observability::EVENTS_PARKED).set(sequencer.parked.len() as f64);
    }

    /// Send one commit's events to every observer. Runs under the sequencer lock.
    fn deliver(&self, events: &[StationEvent]) {
        if events.is_empty() {
            return;
        }
        let mut dropped = Vec::new();
        for event in events {
            metrics::counter!(observability::EVENTS_PUBLISHED_TOTAL, "type" => event.kind())
                .increment(1);
            for entry in self.hub.observers.iter() {
                if dropped.contains(entry.key()) {
                    continue;
                }
                match entry.value().try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(observer = *entry.key(), "observer lagging, dropping");
                        metrics::counter!(observability::OBSERVERS_DROPPED_TOTAL, "reason" => "lagged")
                            .increment(1);
                        dropped.push(*entry.key());
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(observer = *entry.key(), "observer gone");
                        metrics::counter!(observability::OBSERVERS_DROPPED_TOTAL, "reason" => "closed")
                            .increment(1);
                        dropped.push(*entry.key());
                    }
                }
            }
        }
        for id in dropped {
            self.hub.observers.remove(&id);
        }
        metrics::gauge!(observability::OBSERVERS_ACTIVE).set(self.hub.observers.len() as f64);
    }

    pub fn observer_count(&self) -> usize {
        self.hub.observers.len()
    }

    /// Close every observer stream and refuse new ones.
    pub fn shutdown(&self) {
        let _sequencer = self.lock_sequencer();
        self.hub.closed.store(true, Ordering::Release);
        self.hub.observers.clear();
        metrics::gauge!(observability::OBSERVERS_ACTIVE).set(0.0);
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_BUFFER)
    }
}

/// The events of one durable commit, held until its owner lets go of its
/// row locks. Dropping it publishes too, so an abandoned commit never stalls
/// the seqs behind it.
pub struct Outbox {
    seq: Option<u64>,
    events: Vec<StationEvent>,
    broadcaster: Option<Broadcaster>,
}

impl Outbox {
    /// For a commit that wrote nothing and took no seq.
    pub fn empty() -> Self {
        Self {
            seq: None,
            events: Vec::new(),
            broadcaster: None,
        }
    }

    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn events(&self) -> &[StationEvent] {
        &self.events
    }

    pub fn push(&mut self, event: StationEvent) {
        self.events.push(event);
    }

    pub fn release(self) {}
}

impl Drop for Outbox {
    fn drop(&mut self) {
        if let (Some(seq), Some(broadcaster)) = (self.seq, self.broadcaster.take()) {
            broadcaster.release(seq, std::mem::take(&mut self.events));
        }
    }
}

/// One observer's view of the event stream. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<StationEvent>,
    hub: std::sync::Weak<Hub>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `None` once the observer was dropped for lagging or the hub shut down.
    pub async fn recv(&mut self) -> Option<StationEvent> {
        self.rx.recv().await
    }

    /// An event already queued, without waiting for one.
    pub fn try_recv(&mut self) -> Option<StationEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = StationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StationEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.observers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StationStatus;
    use futures::StreamExt;
    use ulid::Ulid;

    fn status_event(seq: u64) -> StationEvent {
        StationEvent::StationStatusUpdate {
            seq,
            station_id: Ulid::new(),
            status: StationStatus::Occupied,
            occupant: Some(Ulid::new()),
            timestamp: 1_000 + seq as i64,
        }
    }

    fn publish(hub: &Broadcaster, events: Vec<StationEvent>) {
        let mut outbox = hub.outbox(events[0].seq());
        for event in events {
            outbox.push(event);
        }
        outbox.release();
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = Broadcaster::default();
        let mut sub = hub.subscribe();

        let event = status_event(1);
        publish(&hub, vec![event.clone()]);

        assert_eq!(sub.recv().await, Some(event));
    }

    #[tokio::test]
    async fn publish_without_observers_is_noop() {
        let hub = Broadcaster::default();
        publish(&hub, vec![status_event(1)]);
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn every_observer_sees_same_order() {
        let hub = Broadcaster::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        let events: Vec<_> = (1..=5).map(status_event).collect();
        for event in &events {
            publish(&hub, vec![event.clone()]);
        }

        for expected in &events {
            assert_eq!(a.recv().await.as_ref(), Some(expected));
            assert_eq!(b.next().await.as_ref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn early_commit_waits_for_earlier_seqs() {
        let hub = Broadcaster::default();
        hub.resume_at(10);
        let mut sub = hub.subscribe();

        let first = hub.outbox(10);
        let mut second = hub.outbox(11);
        second.push(status_event(11));
        let mut third = hub.outbox(12);
        third.push(status_event(12));
        third.push(status_event(12));

        third.release();
        second.release();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );

        // seq 10 had no events; letting go of it unblocks the rest
        drop(first);
        let mut seqs = Vec::new();
        for _ in 0..3 {
            seqs.push(sub.recv().await.unwrap().seq());
        }
        assert_eq!(seqs, vec![11, 12, 12]);
    }

    #[tokio::test]
    async fn empty_outbox_takes_no_seq() {
        let hub = Broadcaster::default();
        let mut sub = hub.subscribe();
        drop(Outbox::empty());
        publish(&hub, vec![status_event(1)]);
        assert_eq!(sub.recv().await.map(|e| e.seq()), Some(1));
    }

    #[tokio::test]
    async fn lagging_observer_is_dropped_others_unaffected() {
        let hub = Broadcaster::new(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        publish(&hub, vec![status_event(1)]);
        assert_eq!(fast.recv().await.map(|e| e.seq()), Some(1));
        publish(&hub, vec![status_event(2)]);
        assert_eq!(fast.recv().await.map(|e| e.seq()), Some(2));
        // slow has 2 queued and never reads; the third overflows it
        publish(&hub, vec![status_event(3)]);
        assert_eq!(fast.recv().await.map(|e| e.seq()), Some(3));
        assert_eq!(hub.observer_count(), 1);

        // Buffered events still drain, then the stream ends.
        assert_eq!(slow.recv().await.map(|e| e.seq()), Some(1));
        assert_eq!(slow.recv().await.map(|e| e.seq()), Some(2));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let hub = Broadcaster::default();
        let sub = hub.subscribe();
        assert_eq!(hub.observer_count(), 1);
        drop(sub);
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_streams() {
        let hub = Broadcaster::default();
        let mut sub = hub.subscribe();
        hub.shutdown();
        assert_eq!(sub.next().await, None);

        let mut late = hub.subscribe();
        assert_eq!(late.recv().await, None);
        assert_eq!(hub.observer_count(), 0);
    }
}
