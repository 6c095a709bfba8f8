//! Observer registry with fault-isolated fan-out.
//!
//! Each observer is an [`ObserverId`] plus the sending half of its queue; the
//! connection that owns the observer drains the receiving half. The
//! broadcaster never owns the connection itself, so a dropped receiver is
//! simply a failed delivery.
//!
//! Queues are unbounded for everything except `frame` events. Status,
//! reasoning, chat and error messages are always queued in order; frames are
//! capped per observer by a backlog counter that the receiver decrements as
//! it drains them.
//!
//! | Delivery result | Effect |
//! |---|---|
//! | queued | counted as delivered |
//! | frame backlog full | that frame skipped for that observer only |
//! | receiver gone | observer removed from the registry |

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use so100_types::OutboundMessage;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Undrained frames allowed per observer. About four seconds at 15 FPS.
pub const DEFAULT_FRAME_BACKLOG: usize = 64;

/// Opaque observer identity, one per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Observer queue
// ─────────────────────────────────────────────────────────────────────────────

/// Create one observer queue allowing at most `frame_backlog` undrained
/// frames.
pub fn observer_queue(frame_backlog: usize) -> (ObserverSender, ObserverReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending_frames = Arc::new(AtomicUsize::new(0));
    (
        ObserverSender {
            tx,
            pending_frames: Arc::clone(&pending_frames),
            frame_backlog: frame_backlog.max(1),
        },
        ObserverReceiver { rx, pending_frames },
    )
}

enum Delivery {
    Queued,
    Skipped,
    Closed,
}

/// Sending half kept by the broadcaster.
#[derive(Clone)]
pub struct ObserverSender {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    pending_frames: Arc<AtomicUsize>,
    frame_backlog: usize,
}

impl ObserverSender {
    fn deliver(&self, message: OutboundMessage) -> Delivery {
        let is_frame = matches!(message, OutboundMessage::Frame { .. });
        if is_frame {
            let limit = self.frame_backlog;
            let reserved = self
                .pending_frames
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1));
            if reserved.is_err() {
                return Delivery::Skipped;
            }
        }
        match self.tx.send(message) {
            Ok(()) => Delivery::Queued,
            Err(_) => {
                if is_frame {
                    self.pending_frames.fetch_sub(1, Ordering::AcqRel);
                }
                Delivery::Closed
            }
        }
    }
}

/// Receiving half handed to the connection that owns an observer.
pub struct ObserverReceiver {
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
    pending_frames: Arc<AtomicUsize>,
}

impl ObserverReceiver {
    /// Next message in broadcast order; `None` once the observer is
    /// unregistered and the queue is drained.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        let message = self.rx.recv().await?;
        self.settle(&message);
        Some(message)
    }

    pub fn try_recv(&mut self) -> Result<OutboundMessage, TryRecvError> {
        let message = self.rx.try_recv()?;
        self.settle(&message);
        Ok(message)
    }

    /// Frames queued and not yet drained.
    pub fn pending_frames(&self) -> usize {
        self.pending_frames.load(Ordering::Acquire)
    }

    fn settle(&self, message: &OutboundMessage) {
        if matches!(message, OutboundMessage::Frame { .. }) {
            self.pending_frames.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionBroadcaster
// ─────────────────────────────────────────────────────────────────────────────

type Registry = HashMap<ObserverId, ObserverSender>;

/// Shared observer registry. Clones share the same set of observers.
#[derive(Clone)]
pub struct ConnectionBroadcaster {
    observers: Arc<RwLock<Registry>>,
    frame_backlog: usize,
}

impl ConnectionBroadcaster {
    pub fn new(frame_backlog: usize) -> Self {
        Self {
            observers: Arc::new(RwLock::new(HashMap::new())),
            frame_backlog: frame_backlog.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.observers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.observers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frame_backlog(&self) -> usize {
        self.frame_backlog
    }

    /// Register a fresh observer and return its id and queue.
    pub fn attach(&self) -> (ObserverId, ObserverReceiver) {
        let id = ObserverId::new();
        let (tx, rx) = observer_queue(self.frame_backlog);
        self.register(id, tx);
        (id, rx)
    }

    /// Register `id` with its delivery queue.
    ///
    /// Returns `false` (and keeps the existing queue) when `id` is already
    /// registered.
    pub fn register(&self, id: ObserverId, sender: ObserverSender) -> bool {
        let mut observers = self.write();
        if observers.contains_key(&id) {
            return false;
        }
        observers.insert(id, sender);
        info!(observer = %id, total = observers.len(), "observer registered");
        true
    }

    /// Remove `id`. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.write();
        let removed = observers.remove(&id).is_some();
        if removed {
            info!(observer = %id, total = observers.len(), "observer unregistered");
        }
        removed
    }

    pub fn contains(&self, id: ObserverId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Deliver `message` to every registered observer.
    ///
    /// Returns the number of observers the message was queued for. Observers
    /// whose connection is gone are removed; the rest still receive it.
    pub fn broadcast(&self, message: &OutboundMessage) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let observers = self.read();
            for (id, tx) in observers.iter() {
                match tx.deliver(message.clone()) {
                    Delivery::Queued => delivered += 1,
                    Delivery::Skipped => {
                        debug!(observer = %id, "frame backlog full, skipping frame");
                    }
                    Delivery::Closed => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut observers = self.write();
            for id in dead {
                observers.remove(&id);
                warn!(observer = %id, "observer gone, removed after failed delivery");
            }
        }
        delivered
    }

    /// Deliver `message` to `id` only. Returns `false` if it could not be
    /// queued; a closed observer is removed.
    pub fn send_to(&self, id: ObserverId, message: OutboundMessage) -> bool {
        let delivery = match self.read().get(&id) {
            Some(tx) => tx.deliver(message),
            None => return false,
        };
        match delivery {
            Delivery::Queued => true,
            Delivery::Skipped => {
                debug!(observer = %id, "frame backlog full, skipping frame");
                false
            }
            Delivery::Closed => {
                self.unregister(id);
                false
            }
        }
    }
}

impl Default for ConnectionBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_BACKLOG)
    }
}
