//! # Connection
//!
//! Purpose: Pair every command written on one socket with its reply.
//! Incoming bytes are accumulated, complete frames are cut off the front of
//! the buffer, and each is handed to the oldest pending request.
//!
//! ## Design Principles
//! 1. **Nothing Queued Unless Written**: A request is enqueued only after its
//!    bytes were accepted by the transport; otherwise it fails immediately.
//! 2. **Drain Per Event**: `process_buffer` decodes every complete frame in the
//!    buffer before returning, so the owner never sees a half-drained state.
//! 3. **No Guessing**: Data with no pending request, or a frame that cannot be
//!    delimited, asks the owner to restart instead of resynchronizing.
//! 4. **Loss Is Total**: When the socket goes away every pending request fails
//!    with `CONNECTION_ERROR` in queue order and partial bytes are discarded.

use std::sync::{Arc, RwLock};

use bytes::{Buf, BytesMut};
use tokio::sync::oneshot;
use tracing::{trace, warn};

use mcache_common::{
    read_line, Adapter, Decoder, ErrorKind, McError, McResult, ParseResult, Request, Response,
    ERROR_PREFIX,
};

use crate::config::ServerAddr;
use crate::queue::PendingQueue;
use crate::socket::Transport;

/// Adapter shared by the client and all of its connections.
pub type SharedAdapter = Arc<RwLock<Adapter>>;

/// Continuation for one request; fired at most once.
pub type Reply = oneshot::Sender<McResult<Response>>;

/// A written request waiting for its reply.
#[derive(Debug)]
pub struct PendingRequest {
    decoder: Decoder,
    reply: Reply,
}

impl PendingRequest {
    pub fn new(decoder: Decoder, reply: Reply) -> Self {
        PendingRequest { decoder, reply }
    }

    fn resolve(self, result: McResult<Response>) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(result);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotReady,
    Ready,
    /// Explicitly closed.
    Closed,
}

/// What the owner must do after the buffer was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The stream is desynchronized; flush and reconnect.
    Restart,
}

/// Per-server protocol state: byte buffer plus pending queue.
pub struct Connection {
    addr: ServerAddr,
    state: ConnectionState,
    buffer: BytesMut,
    queue: PendingQueue<PendingRequest>,
    adapter: SharedAdapter,
    scratch: BytesMut,
}

impl Connection {
    pub fn new(addr: ServerAddr, adapter: SharedAdapter) -> Self {
        Connection {
            addr,
            state: ConnectionState::NotReady,
            buffer: BytesMut::new(),
            queue: PendingQueue::new(),
            adapter,
            scratch: BytesMut::with_capacity(256),
        }
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Outstanding requests.
    pub fn pending(&self) -> usize {
        self.queue.count()
    }

    /// Unconsumed bytes.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Called when the socket reports a successful open.
    pub fn on_open(&mut self) {
        self.state = ConnectionState::Ready;
    }

    /// Sends `request` and queues `reply` for its response.
    ///
    /// Fails `reply` synchronously, without queueing, when the connection is
    /// not ready or the transport rejects the bytes.
    pub fn write<T: Transport>(&mut self, transport: &mut T, request: Request, reply: Reply) {
        if !self.is_ready() {
            let _ = reply.send(Err(McError::no_connection()));
            return;
        }

        self.scratch.clear();
        request.encode(&mut self.scratch);
        match transport.write(&self.scratch) {
            Ok(()) => {
                trace!(host = %self.addr.host, port = self.addr.port, command = %request.line, "queued");
                self.queue.enqueue(PendingRequest::new(request.decoder, reply));
            }
            Err(_) => {
                let _ = reply.send(Err(McError::new(
                    ErrorKind::Connection,
                    "Lost connection to server.",
                )));
            }
        }
    }

    /// Appends a chunk from the socket and dispatches every complete frame.
    pub fn read(&mut self, chunk: &[u8]) -> Flow {
        self.buffer.extend_from_slice(chunk);
        self.process_buffer()
    }

    pub fn process_buffer(&mut self) -> Flow {
        while !self.buffer.is_empty() {
            let decoder = match self.queue.peek() {
                Some(pending) => pending.decoder,
                None => {
                    warn!(
                        host = %self.addr.host,
                        port = self.addr.port,
                        bytes = self.buffer.len(),
                        "unsolicited data, restarting connection"
                    );
                    return Flow::Restart;
                }
            };

            let line = match read_line(&self.buffer, 0) {
                Some(line) => line,
                None => break,
            };

            if line.text.starts_with(ERROR_PREFIX) {
                self.buffer.advance(line.next);
                if let Some(pending) = self.queue.dequeue() {
                    pending.resolve(Err(McError::new(ErrorKind::Server(line.text), "Response Error")));
                }
                continue;
            }

            let parsed = {
                let adapter = self.adapter.read().expect("adapter lock poisoned");
                decoder.decode(&line, &self.buffer, &adapter)
            };
            match parsed {
                ParseResult::Incomplete => break,
                ParseResult::Complete { consumed, result } => {
                    self.buffer.advance(consumed);
                    if let Some(pending) = self.queue.dequeue() {
                        trace!(host = %self.addr.host, port = self.addr.port, consumed, "reply dispatched");
                        pending.resolve(result);
                    }
                }
                ParseResult::Malformed { reason } => {
                    warn!(host = %self.addr.host, port = self.addr.port, %reason, "malformed reply, restarting connection");
                    return Flow::Restart;
                }
            }
        }
        Flow::Continue
    }

    /// Fails every pending request after a loss and drops partial bytes.
    pub fn flush_queue(&mut self) {
        if self.state == ConnectionState::Ready {
            self.state = ConnectionState::NotReady;
        }
        self.buffer.clear();
        for lost in self.queue.drain() {
            lost.resolve(Err(McError::lost_connection()));
        }
    }

    /// Marks the connection closed and fails whatever is still pending.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.flush_queue();
    }

    /// Leaves the closed state so a new open can succeed.
    pub fn reopen(&mut self) {
        if self.state == ConnectionState::Closed {
            self.state = ConnectionState::NotReady;
        }
    }
}
