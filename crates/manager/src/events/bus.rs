//! Owned event channel of a node
//!
//! One [`EventEmitter`] is created per node and cloned into every component
//! that emits. Each subscriber owns an unbounded queue, so a slow subscriber
//! never loses events; it only grows its own backlog. Queues close once the
//! last emitter is dropped.

use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

use super::TaskEvent;

/// Publishing side of the event channel
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<TaskEvent>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to every current subscriber
    ///
    /// The lock is held across the fan-out so all subscribers observe the
    /// same emission order. Closed subscriptions are pruned here.
    pub fn emit(&self, event: TaskEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            trace!(event_type = ?event.event_type(), "no event subscribers");
        }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventSubscription { rx }
    }

    /// Get the number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Receiving side of the event channel
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<TaskEvent>,
}

impl EventSubscription {
    /// Wait for the next event; `None` once every emitter is gone and the
    /// backlog is drained
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }

    /// Next queued event without waiting
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every queued event
    pub fn drain(&mut self) -> Vec<TaskEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Convert into a stream of events
    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::events::TaskManagerStats;

    fn stat(value: f64) -> TaskEvent {
        TaskEvent::manager_stat(TaskManagerStats::Load, Ok(value))
    }

    fn values(events: &[TaskEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| e.as_manager_stat())
            .filter_map(|s| s.event.as_ref().ok().copied())
            .collect()
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_emission_order() {
        let emitter = EventEmitter::new();
        let mut first = emitter.subscribe();
        let mut second = emitter.subscribe();

        emitter.emit(stat(0.1));
        emitter.emit(stat(0.2));

        for sub in [&mut first, &mut second] {
            assert_eq!(values(&sub.drain()), vec![0.1, 0.2]);
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let emitter = EventEmitter::new();
        emitter.emit(stat(1.0));
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.subscribe();
        emitter.emit(stat(0.5));
        drop(emitter);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_idle_subscriber_loses_nothing() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.subscribe();
        for i in 0..5_000 {
            emitter.emit(stat(i as f64));
        }

        let expected: Vec<f64> = (0..5_000).map(|i| i as f64).collect();
        assert_eq!(values(&sub.drain()), expected);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let emitter = EventEmitter::new();
        let kept = emitter.subscribe();
        let dropped = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        drop(dropped);
        emitter.emit(stat(0.0));
        assert_eq!(emitter.subscriber_count(), 1);
        drop(kept);
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_subscribers() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.subscribe();
        let clone = emitter.clone();

        emitter.emit(stat(1.0));
        clone.emit(stat(2.0));
        drop(emitter);
        assert_eq!(values(&sub.drain()), vec![1.0, 2.0]);

        drop(clone);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let emitter = EventEmitter::new();
        let stream = emitter.subscribe().into_stream();
        emitter.emit(stat(0.25));
        drop(emitter);

        let events: Vec<TaskEvent> = stream.collect().await;
        assert_eq!(events.len(), 1);
    }
}
