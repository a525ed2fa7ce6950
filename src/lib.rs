//! Async BLIP messaging client and pull replicator for the Tokio stack.
//!
//! This library speaks the BLIP protocol (subprotocol `BLIP_3+CBMobile_3`)
//! over a single WebSocket connection and drives a pull replication pass
//! against a remote sync endpoint: checkpoint negotiation, change
//! subscription, per-document retrieval, attachment fetch, checkpoint
//! commit. Replicated documents land in a pluggable datastore (SQLite,
//! JSON-lines file, or the console).
//!
//! The layers from the wire up: `varint` and `messenger` handle the frame
//! codec, `client` pumps the WebSocket with a reader and a writer task,
//! `protocol` exposes the asynchronous send/receive surface, and
//! `replicator` runs the replication state machine on top of it.

pub mod client;
pub mod config;
pub mod error;
mod frame;
mod handshake;
pub mod headers;
pub mod message;
pub mod messenger;
pub mod output;
pub mod protocol;
mod read;
pub mod replicator;
mod stream;
mod utils;
pub mod varint;
mod write;
