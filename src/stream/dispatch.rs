//! Delayed local broadcast of decoded stream envelopes.
//!
//! Every envelope handed to [`EventDispatcher::dispatch`] is delivered to the
//! subscribers of `remote.<type>` once the configured delay has passed. A
//! single worker drains a FIFO queue, so delivery follows dispatch order and
//! each [`RemoteEvent`] carries a sequence number that reflects it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::stream::proto::EventEnvelope;

/// Event delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteEvent {
    /// Dispatch order, starting at 1.
    pub seq: u64,
    /// Channel key the event was published under.
    pub key: String,
    /// Decoded envelope.
    pub envelope: EventEnvelope,
}

/// Stand-in deadline for delays too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct Scheduled {
    due_at: Instant,
    generation: u64,
    event: RemoteEvent,
}

#[derive(Default)]
struct Registry {
    listeners: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<RemoteEvent>>>>,
    generation: AtomicU64,
    next_seq: AtomicU64,
}

impl Registry {
    fn deliver(&self, event: RemoteEvent) -> usize {
        let Ok(mut listeners) = self.listeners.lock() else {
            return 0;
        };
        let Some(senders) = listeners.get_mut(&event.key) else {
            return 0;
        };

        senders.retain(|tx| tx.send(event.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            listeners.remove(&event.key);
        }
        delivered
    }
}

/// Cloneable handle to the delivery worker and subscriber registry.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
    queue: mpsc::UnboundedSender<Scheduled>,
    delay: Duration,
    shutdown: CancellationToken,
}

impl EventDispatcher {
    /// Delay used when no explicit value is configured.
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(3000);

    pub fn new(delay: Duration) -> Self {
        let registry = Arc::new(Registry::default());
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(delivery_worker(
            Arc::clone(&registry),
            queue_rx,
            shutdown.clone(),
        ));

        Self {
            registry,
            queue,
            delay,
            shutdown,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Registers a subscriber for a channel key such as `remote.update`.
    pub fn subscribe(&self, key: impl Into<String>) -> EventSubscription {
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.registry.listeners.lock() {
            // Keys that never fire are otherwise only pruned on delivery.
            listeners.retain(|_, senders| {
                senders.retain(|tx| !tx.is_closed());
                !senders.is_empty()
            });
            listeners.entry(key.clone()).or_default().push(tx);
        }
        EventSubscription { key, rx }
    }

    /// Number of live subscribers under `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.registry
            .listeners
            .lock()
            .map(|listeners| {
                listeners
                    .get(key)
                    .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Schedules delivery of `envelope` after the configured delay.
    ///
    /// Returns the sequence number assigned to the event.
    pub fn dispatch(&self, envelope: EventEnvelope) -> u64 {
        let seq = self.registry.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Instant::now();
        let scheduled = Scheduled {
            due_at: now
                .checked_add(self.delay)
                .unwrap_or_else(|| now + FAR_FUTURE),
            generation: self.registry.generation.load(Ordering::SeqCst),
            event: RemoteEvent {
                seq,
                key: envelope.channel_key(),
                envelope,
            },
        };

        if self.queue.send(scheduled).is_err() {
            debug!(event = "dispatch_after_shutdown", seq);
        }
        seq
    }

    /// Drops every event that has been dispatched but not yet delivered.
    pub fn cancel_pending(&self) {
        let generation = self.registry.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(event = "dispatch_pending_cancelled", generation);
    }

    /// Stops the delivery worker. Queued events are dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

async fn delivery_worker(
    registry: Arc<Registry>,
    mut queue: mpsc::UnboundedReceiver<Scheduled>,
    shutdown: CancellationToken,
) {
    loop {
        let scheduled = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = queue.recv() => match next {
                Some(scheduled) => scheduled,
                None => return,
            },
        };

        if scheduled.generation == registry.generation.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep_until(scheduled.due_at) => {}
            }
        }

        // Re-check: cancel_pending may have run while sleeping.
        if scheduled.generation != registry.generation.load(Ordering::SeqCst) {
            trace!(event = "dispatch_dropped", seq = scheduled.event.seq);
            continue;
        }

        let seq = scheduled.event.seq;
        let delivered = registry.deliver(scheduled.event);
        trace!(event = "dispatch_delivered", seq, delivered);
    }
}

/// Receiving half of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    key: String,
    rx: mpsc::UnboundedReceiver<RemoteEvent>,
}

impl EventSubscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the next delivered event.
    pub async fn recv(&mut self) -> Option<RemoteEvent> {
        self.rx.recv().await
    }

    /// Returns an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<RemoteEvent> {
        self.rx.try_recv().ok()
    }
}
