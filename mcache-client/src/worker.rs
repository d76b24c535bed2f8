//! Connection driver task and the handle the client talks to.
//!
//! # Purpose
//! Owns one `Connection` and its `SocketLifecycle` inside a single spawned
//! task, so buffer processing, queue mutation and socket writes are never
//! concurrent for a given server.
//!
//! # Design notes
//! Commands arrive over an unbounded mpsc channel and are applied in order;
//! the socket is driven in the same `select!`. Callers never wait on the
//! remote while dispatching, only on their own oneshot receiver.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use mcache_common::{McError, McResult, Request, Response};

use crate::config::{BackoffConfig, ServerAddr};
use crate::connection::{Connection, Flow, Reply, SharedAdapter};
use crate::socket::{SocketEvent, SocketLifecycle, SocketState};

pub(crate) enum Command {
    /// Connect if needed; `ready` fires once the connection is usable.
    Open { ready: oneshot::Sender<()> },
    Write { request: Request, reply: Reply },
    Restart,
    Close,
}

pub(crate) async fn run_connection(
    mut conn: Connection,
    mut socket: SocketLifecycle,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();
    debug!(host = %conn.addr().host, port = conn.addr().port, "connection worker started");
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Open { ready }) => {
                    if conn.is_ready() {
                        let _ = ready.send(());
                        continue;
                    }
                    waiters.push(ready);
                    match socket.state() {
                        SocketState::Idle => socket.open(),
                        SocketState::Disabled => {
                            conn.reopen();
                            socket.restart();
                        }
                        _ => {}
                    }
                }
                Some(Command::Write { request, reply }) => conn.write(&mut socket, request, reply),
                Some(Command::Restart) => {
                    conn.reopen();
                    conn.flush_queue();
                    socket.restart();
                }
                Some(Command::Close) => {
                    socket.close();
                    conn.close();
                    waiters.clear();
                }
                None => {
                    socket.close();
                    conn.close();
                    break;
                }
            },
            event = socket.next_event() => match event {
                SocketEvent::Opened => {
                    conn.on_open();
                    for ready in waiters.drain(..) {
                        let _ = ready.send(());
                    }
                }
                SocketEvent::Data(chunk) => {
                    if conn.read(&chunk) == Flow::Restart {
                        conn.flush_queue();
                        socket.restart();
                    }
                }
                SocketEvent::Lost => conn.flush_queue(),
            },
        }
    }
    debug!(host = %conn.addr().host, port = conn.addr().port, "connection worker stopped");
}

struct Worker {
    rx: Option<mpsc::UnboundedReceiver<Command>>,
    task: Option<JoinHandle<()>>,
}

/// Client-side endpoint of one connection worker.
///
/// The worker task is spawned lazily on the first `open`, so a handle can be
/// built outside a runtime.
pub struct ConnectionHandle {
    addr: ServerAddr,
    tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Worker>,
    adapter: SharedAdapter,
    backoff: BackoffConfig,
    nodelay: bool,
}

impl ConnectionHandle {
    pub(crate) fn new(addr: ServerAddr, adapter: SharedAdapter, backoff: BackoffConfig, nodelay: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ConnectionHandle {
            addr,
            tx,
            worker: Mutex::new(Worker {
                rx: Some(rx),
                task: None,
            }),
            adapter,
            backoff,
            nodelay,
        }
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock().expect("worker lock poisoned");
        if let Some(rx) = worker.rx.take() {
            let conn = Connection::new(self.addr.clone(), self.adapter.clone());
            let socket = SocketLifecycle::new(self.addr.clone(), &self.backoff, self.nodelay);
            worker.task = Some(tokio::spawn(run_connection(conn, socket, rx)));
        }
    }

    fn is_started(&self) -> bool {
        self.worker.lock().expect("worker lock poisoned").task.is_some()
    }

    /// Starts (or re-enables) the connection. The receiver fires once it is
    /// ready; it is dropped without a value if the connection is closed first.
    pub(crate) fn open(&self) -> oneshot::Receiver<()> {
        self.ensure_worker();
        let (ready, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Open { ready });
        rx
    }

    /// Queues `request` on the worker and returns the reply future.
    ///
    /// Dispatch happens before the future is first polled, so requests issued
    /// back to back keep their order on the wire.
    pub(crate) fn dispatch(&self, request: Request) -> impl Future<Output = McResult<Response>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        if self.is_started() {
            if let Err(mpsc::error::SendError(Command::Write { reply, .. })) =
                self.tx.send(Command::Write { request, reply })
            {
                let _ = reply.send(Err(McError::no_connection()));
            }
        } else {
            let _ = reply.send(Err(McError::no_connection()));
        }
        async move { rx.await.unwrap_or_else(|_| Err(McError::lost_connection())) }
    }

    /// Flushes pending requests and reconnects immediately.
    pub(crate) fn restart(&self) {
        if self.is_started() {
            let _ = self.tx.send(Command::Restart);
        }
    }

    /// Disables the connection; pending requests fail with CONNECTION_ERROR.
    pub(crate) fn close(&self) {
        if self.is_started() {
            let _ = self.tx.send(Command::Close);
        }
    }
}
