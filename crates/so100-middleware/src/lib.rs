//! `so100-middleware` – fan-out between the session and its observers.
//!
//! Routes [`OutboundMessage`]s to every connected observer without caring
//! what they mean, and without letting one broken connection affect the
//! others.
//!
//! # Modules
//!
//! - [`broadcaster`] – [`ConnectionBroadcaster`]: observer registry plus
//!   fault-isolated broadcast, originator-only replies and a per-observer
//!   frame backlog.
//!
//! [`OutboundMessage`]: so100_types::OutboundMessage

pub mod broadcaster;

pub use broadcaster::{
    ConnectionBroadcaster, DEFAULT_FRAME_BACKLOG, ObserverId, ObserverReceiver, ObserverSender, observer_queue,
};
