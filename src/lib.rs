//! Cablecast - Real-Time Page Update Broadcasting
//!
//! This crate implements a topic-addressed pub/sub broker and an Action
//! Cable-compatible websocket transport for pushing Turbo Streams page
//! updates to browsers over persistent connections.

pub mod broker;
pub mod cable;
pub mod config;
pub mod pubsub;
pub mod streams;
