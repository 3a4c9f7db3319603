//! Action Cable-compatible websocket transport.
//!
//! Persistent bidirectional connections multiplexing named subscriptions
//! over one socket, wire-compatible with stock Action Cable clients:
//! upgrade ([`handler`]), per-socket protocol state machine
//! ([`connection`]), channel dispatch ([`channel`]), and session-wide
//! cancellation ([`cancellers`]).

pub mod cancellers;
pub mod channel;
pub mod connection;
pub mod handler;
pub mod messages;
pub mod subscription;

pub use cancellers::Cancellers;
pub use channel::{Channel, ChannelDispatcher, ChannelError, ChannelFactory, Unsubscriber};
pub use connection::{Connection, ConnectionError, SUBPROTOCOL};
pub use handler::{routes, CableState, SessionFactories, SessionResolver};
pub use messages::{ClientMessage, DisconnectMessage, ServerMessage};
pub use subscription::Subscription;
