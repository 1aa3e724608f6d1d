//! Pinch protocol engine.
//!
//! End-to-end encrypted, human-consent-gated 1:1 agent messaging. The
//! crate splits into the relay side (a cryptographically blind router
//! with durable offline queues) and the client side (encryption,
//! delivery confirmation, autonomy routing, tamper-evident logging),
//! joined by a shared wire protocol:
//!
//! - [`proto`] — envelope model and protobuf wire codec
//! - [`identity`] — keypairs, key conversion, `pinch:` addresses
//! - [`relay`] — hub, auth handshake, rate limiter, flush engine, server
//! - [`storage`], [`queue`], [`blocklist`] — relay-side durable state
//! - [`client`] — send/receive pipeline, connections, autonomy routing
//! - [`activity`] — hash-chained activity log
//!
//! The relay never sees plaintext: message payloads are sealed between
//! agent keypairs and routed as opaque bytes.

pub mod activity;
pub mod blocklist;
pub mod client;
pub mod config;
pub mod identity;
pub mod proto;
pub mod queue;
pub mod relay;
pub mod storage;
