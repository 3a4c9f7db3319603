//! In-process publish/subscribe core.
//!
//! The [`Hub`] maps topics to sets of receiver callbacks and reports
//! topic activation/deactivation (subscriber count crossing 0↔1) on a
//! change channel consumed by the broker.

mod hub;

pub use hub::{Hub, ReceiveFn, TopicChange, Unsubscriber};
