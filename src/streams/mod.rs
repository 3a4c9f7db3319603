//! Turbo Streams over the cable: signed stream names and the
//! `Turbo::StreamsChannel` adapter between transport and broker.

pub mod channel;
pub mod signer;

pub use channel::{
    channel_factory, identifier, session_channel_factory, StreamsChannel, CHANNEL_NAME,
};
pub use signer::{Signer, SignerError};
