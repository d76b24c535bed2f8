//! # Mcache Cluster Client
//!
//! Purpose: Asynchronous client for a static cluster of memcached-style
//! text-protocol servers, with key sharding, pipelining and automatic
//! reconnection.
//!
//! ## Design Principles
//! 1. **One Task Per Server**: Each connection is driven by its own tokio task;
//!    callers only exchange messages with it.
//! 2. **Strict FIFO Pipelining**: Replies are matched to requests purely by
//!    order on the wire.
//! 3. **Self-Healing**: Lost connections fail their pending requests and
//!    reconnect with exponential backoff, forever.
//! 4. **Typed Results**: Every operation resolves to `McResult<T>`.

mod client;
mod config;
mod connection;
mod queue;
mod socket;
mod strategy;
mod worker;

pub use client::Client;
pub use config::{BackoffConfig, ClientConfig, ServerAddr};
pub use connection::{Connection, ConnectionState, Flow, PendingRequest, Reply, SharedAdapter};
pub use queue::PendingQueue;
pub use socket::{Backoff, SocketEvent, SocketLifecycle, SocketState, Transport};
pub use strategy::{crc32, Strategy};
pub use worker::ConnectionHandle;

pub use mcache_common::{
    Adapter, Entry, ErrorKind, Item, McError, McResult, RetrieveVerb, StatsKind, StatsRecord,
    StoreOptions, StoreVerb, Value, Values,
};
