//! # Socket Lifecycle
//!
//! Purpose: Keep one long-lived logical connection to a `(host, port)` and
//! hide reconnect churn from the owner.
//!
//! ## Design Principles
//! 1. **State Machine**: `Idle -> Opening -> Open -> ClosedRetrying -> Opening`
//!    with `Disabled` as the terminal state after an explicit close.
//! 2. **Exponential Backoff**: Each failed or lost cycle doubles the delay up
//!    to a cap; a successful open resets it to the floor. Retries never give up
//!    while enabled.
//! 3. **Cancel-Safe Events**: `next_event` can be dropped at any await point
//!    (it sits inside a `select!`). The pending connect future and the retry
//!    deadline are stored on the struct so nothing is lost or restarted.
//! 4. **Non-Blocking Writes**: `Transport::write` only appends to an outbound
//!    buffer; `next_event` flushes it while also reading.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use mcache_common::{McError, McResult};

use crate::config::{BackoffConfig, ServerAddr};

const READ_CHUNK: usize = 8 * 1024;

/// Sink for encoded command bytes.
pub trait Transport {
    /// Queues `bytes` for the peer.
    ///
    /// # Errors
    /// Fails with a connection error when the socket is not open.
    fn write(&mut self, bytes: &[u8]) -> McResult<()>;
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    floor: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Backoff {
            delay: config.initial(),
            floor: config.floor(),
            max: config.max(),
        }
    }

    /// Doubles the delay (bounded by the cap) and returns it.
    pub fn next_delay(&mut self) -> Duration {
        self.delay = (self.delay * 2).max(Duration::from_millis(1)).min(self.max);
        self.delay
    }

    pub fn reset(&mut self) {
        self.delay = self.floor;
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Created, never opened.
    Idle,
    Opening,
    Open,
    /// Lost or failed; a reconnect is scheduled.
    ClosedRetrying,
    /// Closed on purpose; no retries.
    Disabled,
}

/// Something the owner has to react to.
#[derive(Debug)]
pub enum SocketEvent {
    /// A connection was established (initially or after a reconnect).
    Opened,
    /// Raw bytes from the peer.
    Data(Bytes),
    /// The connection dropped; a reconnect has been scheduled.
    Lost,
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// Reusable logical socket for one server.
pub struct SocketLifecycle {
    addr: ServerAddr,
    state: SocketState,
    backoff: Backoff,
    nodelay: bool,
    stream: Option<TcpStream>,
    connecting: Option<ConnectFuture>,
    // At most one reconnect timer.
    retry_at: Option<Instant>,
    inbound: BytesMut,
    outbound: BytesMut,
}

impl SocketLifecycle {
    pub fn new(addr: ServerAddr, backoff: &BackoffConfig, nodelay: bool) -> Self {
        SocketLifecycle {
            addr,
            state: SocketState::Idle,
            backoff: Backoff::new(backoff),
            nodelay,
            stream: None,
            connecting: None,
            retry_at: None,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Starts the first connection attempt. A disabled socket stays disabled.
    pub fn open(&mut self) {
        if self.state == SocketState::Idle {
            self.begin_connect();
        }
    }

    /// Disables retries and drops the transport.
    pub fn close(&mut self) {
        debug!(host = %self.addr.host, port = self.addr.port, "socket closed");
        self.state = SocketState::Disabled;
        self.teardown();
    }

    /// Drops the transport (if any) and reconnects right away, re-enabling
    /// a disabled socket.
    pub fn restart(&mut self) {
        self.teardown();
        self.begin_connect();
    }

    fn teardown(&mut self) {
        self.stream = None;
        self.connecting = None;
        self.retry_at = None;
        self.inbound.clear();
        self.outbound.clear();
    }

    fn begin_connect(&mut self) {
        self.state = SocketState::Opening;
        self.connecting = None;
        self.retry_at = None;
    }

    fn schedule_retry(&mut self) {
        self.state = SocketState::ClosedRetrying;
        if self.retry_at.is_none() {
            let delay = self.backoff.next_delay();
            debug!(
                host = %self.addr.host,
                port = self.addr.port,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            self.retry_at = Some(Instant::now() + delay);
        }
    }

    fn lose(&mut self, reason: &str) -> SocketEvent {
        debug!(host = %self.addr.host, port = self.addr.port, reason, "connection lost");
        self.stream = None;
        self.inbound.clear();
        self.outbound.clear();
        self.schedule_retry();
        SocketEvent::Lost
    }

    /// Drives the state machine until something happens.
    ///
    /// Never resolves while the socket is idle or disabled.
    pub async fn next_event(&mut self) -> SocketEvent {
        loop {
            match self.state {
                SocketState::Idle | SocketState::Disabled => {
                    return std::future::pending().await;
                }
                SocketState::ClosedRetrying => {
                    if let Some(deadline) = self.retry_at {
                        tokio::time::sleep_until(deadline).await;
                    }
                    self.begin_connect();
                }
                SocketState::Opening => {
                    let host = self.addr.host.clone();
                    let port = self.addr.port;
                    let connecting = self.connecting.get_or_insert_with(|| {
                        let fut: ConnectFuture =
                            Box::pin(async move { TcpStream::connect((host.as_str(), port)).await });
                        fut
                    });
                    let result = connecting.as_mut().await;
                    self.connecting = None;
                    match result {
                        Ok(stream) => {
                            if self.nodelay {
                                // Small request/reply frames; do not wait for coalescing.
                                let _ = stream.set_nodelay(true);
                            }
                            self.stream = Some(stream);
                            self.state = SocketState::Open;
                            self.backoff.reset();
                            debug!(host = %self.addr.host, port = self.addr.port, "socket open");
                            return SocketEvent::Opened;
                        }
                        Err(err) => {
                            debug!(
                                host = %self.addr.host,
                                port = self.addr.port,
                                error = %err,
                                "connect failed"
                            );
                            self.schedule_retry();
                        }
                    }
                }
                SocketState::Open => {
                    let flush = !self.outbound.is_empty();
                    let outcome = match self.stream.as_mut() {
                        Some(stream) => {
                            let (mut reader, mut writer) = stream.split();
                            tokio::select! {
                                read = reader.read_buf(&mut self.inbound) => IoOutcome::Read(read),
                                written = writer.write_buf(&mut self.outbound), if flush => {
                                    IoOutcome::Wrote(written)
                                }
                            }
                        }
                        None => IoOutcome::Missing,
                    };
                    match outcome {
                        IoOutcome::Read(Ok(0)) => return self.lose("closed by peer"),
                        IoOutcome::Read(Ok(_)) => {
                            return SocketEvent::Data(self.inbound.split().freeze());
                        }
                        IoOutcome::Wrote(Ok(0)) => return self.lose("write returned zero"),
                        IoOutcome::Wrote(Ok(_)) => {}
                        IoOutcome::Read(Err(err)) | IoOutcome::Wrote(Err(err)) => {
                            return self.lose(&err.to_string());
                        }
                        IoOutcome::Missing => return self.lose("missing stream"),
                    }
                }
            }
        }
    }
}

enum IoOutcome {
    Read(io::Result<usize>),
    Wrote(io::Result<usize>),
    Missing,
}

impl Transport for SocketLifecycle {
    fn write(&mut self, bytes: &[u8]) -> McResult<()> {
        if self.state != SocketState::Open {
            return Err(McError::lost_connection());
        }
        self.outbound.extend_from_slice(bytes);
        Ok(())
    }
}
