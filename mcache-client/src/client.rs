//! # Cluster Client
//!
//! Purpose: The public facade. Validates arguments, picks the owning
//! connection for each key and turns replies into typed results.
//!
//! ## Design Principles
//! 1. **Fail Fast**: Key, expiration and argument checks run before anything
//!    is written, so invalid calls cost no round trip.
//! 2. **Dispatch, Then Await**: Fan-out operations hand every request to its
//!    connection before waiting on any reply; connections progress in
//!    parallel and results come back in connection order.
//! 3. **One Shard Per Key**: The strategy alone decides where a key lives.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::debug;

use mcache_common::{
    validate_expiration, validate_key, Adapter, CounterVerb, ErrorKind, McError, McResult, Request,
    Response, RetrieveVerb, StatsKind, StatsRecord, StoreOptions, StoreVerb, Values,
};

use crate::config::{ClientConfig, ServerAddr};
use crate::connection::SharedAdapter;
use crate::strategy::Strategy;
use crate::worker::ConnectionHandle;

/// Client for a static cluster of text-protocol cache servers.
pub struct Client {
    connections: Vec<ConnectionHandle>,
    strategy: Strategy,
    adapter: SharedAdapter,
    ttl: AtomicU32,
}

impl Client {
    /// Builds a client for `servers` (`host[:port]`) with default settings.
    pub fn new<I, S>(servers: I) -> McResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Client::with_config(ClientConfig::with_servers(servers))
    }

    pub fn with_config(config: ClientConfig) -> McResult<Self> {
        Client::with_options(config, None, None)
    }

    /// Builds a client with an explicit adapter and/or strategy.
    ///
    /// Without a strategy, one server uses `Solo` and several use `Hash`.
    pub fn with_options(
        config: ClientConfig,
        adapter: Option<Adapter>,
        strategy: Option<Strategy>,
    ) -> McResult<Self> {
        let addrs = config.addrs()?;
        let adapter: SharedAdapter = Arc::new(RwLock::new(adapter.unwrap_or_default()));
        let strategy = strategy.unwrap_or_else(|| Strategy::for_count(addrs.len()));
        let connections = addrs
            .into_iter()
            .map(|addr| ConnectionHandle::new(addr, adapter.clone(), config.backoff, config.nodelay))
            .collect();
        Ok(Client {
            connections,
            strategy,
            adapter,
            ttl: AtomicU32::new(config.default_ttl),
        })
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerAddr> {
        self.connections.iter().map(ConnectionHandle::addr)
    }

    /// Opens every connection and resolves once all of them are ready.
    ///
    /// Unreachable servers are retried forever, so this only returns once
    /// the whole cluster answered (or `disconnect` was called meanwhile).
    pub async fn connect(&self) -> McResult<()> {
        let ready: Vec<_> = self.connections.iter().map(ConnectionHandle::open).collect();
        for rx in ready {
            rx.await.map_err(|_| McError::no_connection())?;
        }
        debug!(servers = self.connections.len(), "cluster connected");
        Ok(())
    }

    /// Closes every connection and stops reconnecting.
    pub fn disconnect(&self) {
        for conn in &self.connections {
            conn.close();
        }
    }

    /// Drops every transport and reconnects right away. Pending requests fail
    /// with CONNECTION_ERROR.
    pub fn restart(&self) {
        for conn in &self.connections {
            conn.restart();
        }
    }

    /// Sets the expiration used by stores without an explicit one.
    pub fn set_time_to_live(&self, seconds: u32) -> McResult<()> {
        validate_expiration(seconds)?;
        self.ttl.store(seconds, Ordering::Relaxed);
        Ok(())
    }

    pub fn time_to_live(&self) -> u32 {
        self.ttl.load(Ordering::Relaxed)
    }

    /// Replaces the adapter for every connection; replies decoded from now on
    /// use it.
    pub fn set_adapter(&self, adapter: Adapter) {
        *self.adapter.write().expect("adapter lock poisoned") = adapter;
    }

    /// Index of the connection that owns `key`.
    pub fn connection_index(&self, key: &str) -> usize {
        self.strategy.select(key, self.connections.len())
    }

    fn connection(&self, key: &str) -> &ConnectionHandle {
        &self.connections[self.connection_index(key)]
    }

    /// Runs one of the storage commands and returns the server's reply line
    /// (normally `STORED`).
    pub async fn store(
        &self,
        verb: StoreVerb,
        key: &str,
        value: impl AsRef<[u8]>,
        options: StoreOptions,
    ) -> McResult<String> {
        validate_key(key)?;
        if let Some(seconds) = options.expiration {
            validate_expiration(seconds)?;
        }
        let cas = match (verb, options.cas) {
            (StoreVerb::Cas, None) => {
                return Err(McError::new(ErrorKind::Client, "cas requires a token"));
            }
            (StoreVerb::Cas, token) => token,
            _ => None,
        };
        let exptime = options.expiration.unwrap_or_else(|| self.time_to_live());
        let request = Request::store(
            verb,
            key,
            options.flags.unwrap_or(0),
            exptime,
            cas,
            Bytes::copy_from_slice(value.as_ref()),
        );
        self.connection(key).dispatch(request).await?.into_line()
    }

    pub async fn set(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Set, key, value, options).await
    }

    /// Stores only if the key does not exist yet.
    pub async fn add(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Add, key, value, options).await
    }

    /// Stores only if the key already exists.
    pub async fn replace(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Replace, key, value, options).await
    }

    pub async fn append(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Append, key, value, options).await
    }

    pub async fn prepend(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Prepend, key, value, options).await
    }

    /// Stores only if the item's CAS token still equals `token`.
    ///
    /// # Errors
    /// `EXISTS` when the item changed since it was read, `NOT_FOUND` when it
    /// is gone.
    pub async fn cas(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        token: u64,
        options: StoreOptions,
    ) -> McResult<String> {
        self.store(StoreVerb::Cas, key, value, options.cas(token)).await
    }

    /// Fetches one key. Misses fail with `NOT_FOUND`.
    pub async fn get(&self, key: &str) -> McResult<Values> {
        self.retrieve(RetrieveVerb::Get, key).await
    }

    /// Like `get`, with CAS tokens attached to the entries.
    pub async fn gets(&self, key: &str) -> McResult<Values> {
        self.retrieve(RetrieveVerb::Gets, key).await
    }

    async fn retrieve(&self, verb: RetrieveVerb, key: &str) -> McResult<Values> {
        validate_key(key)?;
        let request = Request::retrieve(verb, &[key]);
        self.connection(key).dispatch(request).await?.into_values()
    }

    pub async fn get_multi<S: AsRef<str>>(&self, keys: &[S]) -> McResult<Values> {
        self.multi_get(RetrieveVerb::Get, keys).await
    }

    pub async fn gets_multi<S: AsRef<str>>(&self, keys: &[S]) -> McResult<Values> {
        self.multi_get(RetrieveVerb::Gets, keys).await
    }

    /// Fetches several keys with one command per owning connection and
    /// merges the replies. Keys missing everywhere give `NOT_FOUND`.
    pub async fn multi_get<S: AsRef<str>>(&self, verb: RetrieveVerb, keys: &[S]) -> McResult<Values> {
        let mut buckets: Vec<Vec<&str>> = vec![Vec::new(); self.connections.len()];
        for key in keys {
            let key = key.as_ref();
            validate_key(key)?;
            buckets[self.connection_index(key)].push(key);
        }

        let replies: Vec<_> = buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(index, bucket)| self.connections[index].dispatch(Request::retrieve(verb, bucket)))
            .collect();

        let mut merged = Values::new();
        for reply in replies {
            match reply.await.and_then(Response::into_values) {
                Ok(values) => merged.extend(values),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if merged.is_empty() {
            return Err(McError::new(ErrorKind::NotFound, "No Value Available"));
        }
        Ok(merged)
    }

    /// Increments a numeric value by `delta` (default 1) and returns the new
    /// value.
    pub async fn incr(&self, key: &str, delta: Option<u64>) -> McResult<u64> {
        self.counter(CounterVerb::Incr, key, delta).await
    }

    /// Decrements a numeric value; the server clamps at zero.
    pub async fn decr(&self, key: &str, delta: Option<u64>) -> McResult<u64> {
        self.counter(CounterVerb::Decr, key, delta).await
    }

    async fn counter(&self, verb: CounterVerb, key: &str, delta: Option<u64>) -> McResult<u64> {
        validate_key(key)?;
        let request = Request::counter(verb, key, delta.unwrap_or(1));
        self.connection(key).dispatch(request).await?.into_number()
    }

    pub async fn delete(&self, key: &str) -> McResult<String> {
        validate_key(key)?;
        self.connection(key).dispatch(Request::delete(key)).await?.into_line()
    }

    /// Version string of every server, in connection order.
    pub async fn version(&self) -> Vec<McResult<String>> {
        let replies: Vec<_> = self
            .connections
            .iter()
            .map(|conn| conn.dispatch(Request::version()))
            .collect();
        let mut versions = Vec::with_capacity(replies.len());
        for reply in replies {
            versions.push(reply.await.and_then(Response::into_version));
        }
        versions
    }

    /// Statistics of every server, in connection order.
    pub async fn stats(&self, kind: StatsKind) -> Vec<McResult<StatsRecord>> {
        let replies: Vec<_> = self
            .connections
            .iter()
            .map(|conn| conn.dispatch(Request::stats(&kind)))
            .collect();
        let mut records = Vec::with_capacity(replies.len());
        for reply in replies {
            records.push(reply.await.and_then(Response::into_stats));
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> Client {
        Client::new(["a:1", "b:2", "c:3"]).unwrap()
    }

    #[test]
    fn builds_from_server_list() {
        let client = cluster();
        let servers: Vec<String> = client.servers().map(|s| s.to_string()).collect();
        assert_eq!(servers, vec!["a:1", "b:2", "c:3"]);
        assert_eq!(client.time_to_live(), 0);
    }

    #[test]
    fn rejects_empty_server_list() {
        let err = Client::new(Vec::<String>::new()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn time_to_live_is_bounded() {
        let client = cluster();
        client.set_time_to_live(2_592_000).unwrap();
        let err = client.set_time_to_live(2_592_001).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidExpiration);
        assert_eq!(err.description, "Value 2592001 exceeds max of 2592000");
        assert_eq!(client.time_to_live(), 2_592_000);
    }

    #[test]
    fn routing_follows_strategy() {
        let client = Client::new(["localhost:11211"]).unwrap();
        assert_eq!(client.connection_index("anything"), 0);

        let servers: Vec<String> = (0..16).map(|i| format!("h{}:11211", i)).collect();
        let client = Client::new(servers).unwrap();
        assert_eq!(client.connection_index("Hello World"), 6);

        let client = Client::with_options(
            ClientConfig::with_servers(["a", "b"]),
            None,
            Some(Strategy::custom(|key, _| key.len())),
        )
        .unwrap();
        assert_eq!(client.connection_index("abc"), 1);
        assert_eq!(client.connection_index("ab"), 0);
    }

    #[tokio::test]
    async fn validation_happens_before_dispatch() {
        let client = cluster();
        let long = "x".repeat(251);
        let err = client.set(&long, "v", StoreOptions::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Client);
        assert_eq!(err.description, "Key too long, max 250 char");

        let err = client
            .set("k", "v", StoreOptions::new().expiration(2_592_001))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidExpiration);

        let err = client.get("has space").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Client);

        let err = client.store(StoreVerb::Cas, "k", "v", StoreOptions::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Client);
    }

    #[tokio::test]
    async fn requests_before_connect_fail() {
        let client = cluster();
        let err = client.get("k").await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(err.description, "No Connection Available.");

        let versions = client.version().await;
        assert_eq!(versions.len(), 3);
        assert!(versions.iter().all(|v| v.as_ref().unwrap_err().is_connection()));
    }

    #[tokio::test]
    async fn empty_multi_get_is_not_found() {
        let client = cluster();
        let err = client.get_multi::<&str>(&[]).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
