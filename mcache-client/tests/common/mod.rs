use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use mcache_client::{BackoffConfig, Client, ClientConfig};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Key whose fetch makes the server hang up without replying.
pub const HANGUP_KEY: &str = "hangup";
/// Key whose fetch is answered with an unrequested extra line.
pub const CHATTY_KEY: &str = "chatty";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub version: String,
    /// Write replies one byte at a time.
    pub trickle: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            version: "1.6.21".to_string(),
            trickle: false,
        }
    }
}

struct Item {
    flags: u32,
    data: Vec<u8>,
    cas: u64,
}

#[derive(Default)]
struct State {
    items: Mutex<HashMap<String, Item>>,
    commands: Mutex<Vec<String>>,
    next_cas: AtomicUsize,
    accepted: AtomicUsize,
}

/// Minimal in-memory text-protocol server.
pub struct FakeServer {
    pub addr: String,
    state: Arc<State>,
}

impl FakeServer {
    pub async fn start() -> FakeServer {
        FakeServer::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(options: ServerOptions) -> FakeServer {
        FakeServer::start_at("127.0.0.1:0", options).await
    }

    pub async fn start_at(addr: &str, options: ServerOptions) -> FakeServer {
        let listener = TcpListener::bind(addr).await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let state = Arc::new(State::default());
        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, shared.clone(), options.clone()));
            }
        });
        FakeServer { addr, state }
    }

    /// Command lines received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }
}

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_ms: 1,
        floor_ms: 5,
        max_ms: 50,
    }
}

pub fn client_for(servers: &[&FakeServer]) -> Client {
    client_at(servers.iter().map(|s| s.addr.clone()))
}

pub fn client_at<I: IntoIterator<Item = String>>(addrs: I) -> Client {
    let mut config = ClientConfig::with_servers(addrs);
    config.backoff = fast_backoff();
    Client::with_config(config).expect("client")
}

/// Address of a port that was free a moment ago and has nothing listening.
pub fn unused_addr() -> String {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    reserved.local_addr().expect("addr").to_string()
}

async fn serve(mut stream: TcpStream, state: Arc<State>, options: ServerOptions) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        while let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).to_string();
            let parts: Vec<&str> = line.split(' ').collect();
            let mut consumed = pos + 2;
            let mut data = None;
            if is_storage(parts[0]) {
                let len: usize = match parts.get(4).and_then(|p| p.parse().ok()) {
                    Some(len) => len,
                    None => return,
                };
                if buf.len() < consumed + len + 2 {
                    break;
                }
                data = Some(buf[consumed..consumed + len].to_vec());
                consumed += len + 2;
            }
            buf.advance(consumed);
            state.commands.lock().unwrap().push(line.clone());

            let reply = match handle(&state, &options, &parts, data) {
                Some(reply) => reply,
                None => return,
            };
            if options.trickle {
                for byte in reply {
                    if stream.write_all(&[byte]).await.is_err() {
                        return;
                    }
                    let _ = stream.flush().await;
                }
            } else if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn is_storage(verb: &str) -> bool {
    matches!(verb, "set" | "add" | "replace" | "append" | "prepend" | "cas")
}

fn handle(state: &State, options: &ServerOptions, parts: &[&str], data: Option<Vec<u8>>) -> Option<Vec<u8>> {
    let mut items = state.items.lock().unwrap();
    let reply = match parts[0] {
        verb if is_storage(verb) => {
            let key = parts[1].to_string();
            let flags: u32 = parts[2].parse().unwrap_or(0);
            let data = data.unwrap_or_default();
            let cas = state.next_cas.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            let exists = items.contains_key(&key);
            let stored = match verb {
                "set" => true,
                "add" => !exists,
                "replace" | "append" | "prepend" => exists,
                _ => {
                    let token: u64 = parts.get(5).and_then(|t| t.parse().ok()).unwrap_or(0);
                    match items.get(&key) {
                        None => return Some(b"NOT_FOUND\r\n".to_vec()),
                        Some(item) if item.cas != token => return Some(b"EXISTS\r\n".to_vec()),
                        Some(_) => true,
                    }
                }
            };
            if !stored {
                return Some(b"NOT_STORED\r\n".to_vec());
            }
            let item = match (verb, items.remove(&key)) {
                ("append", Some(mut old)) => {
                    old.data.extend_from_slice(&data);
                    old.cas = cas;
                    old
                }
                ("prepend", Some(mut old)) => {
                    let mut joined = data;
                    joined.extend_from_slice(&old.data);
                    old.data = joined;
                    old.cas = cas;
                    old
                }
                _ => Item { flags, data, cas },
            };
            items.insert(key, item);
            b"STORED\r\n".to_vec()
        }
        "get" | "gets" => {
            let mut out = Vec::new();
            for key in &parts[1..] {
                if *key == HANGUP_KEY {
                    return None;
                }
                if let Some(item) = items.get(*key) {
                    let header = if parts[0] == "gets" {
                        format!("VALUE {} {} {} {}\r\n", key, item.flags, item.data.len(), item.cas)
                    } else {
                        format!("VALUE {} {} {}\r\n", key, item.flags, item.data.len())
                    };
                    out.extend_from_slice(header.as_bytes());
                    out.extend_from_slice(&item.data);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"END\r\n");
            if parts[1..].contains(&CHATTY_KEY) {
                out.extend_from_slice(b"STORED\r\n");
            }
            out
        }
        "incr" | "decr" => {
            let delta: u64 = parts.get(2).and_then(|d| d.parse().ok()).unwrap_or(0);
            match items.get_mut(parts[1]) {
                None => b"NOT_FOUND\r\n".to_vec(),
                Some(item) => match String::from_utf8_lossy(&item.data).parse::<u64>() {
                    Ok(current) => {
                        let next = if parts[0] == "incr" {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        };
                        item.data = next.to_string().into_bytes();
                        format!("{}\r\n", next).into_bytes()
                    }
                    Err(_) => b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec(),
                },
            }
        }
        "delete" => match items.remove(parts[1]) {
            Some(_) => b"DELETED\r\n".to_vec(),
            None => b"NOT_FOUND\r\n".to_vec(),
        },
        "version" => format!("VERSION {}\r\n", options.version).into_bytes(),
        "stats" => match parts.get(1).copied() {
            None => format!(
                "STAT pid 42\r\nSTAT version {}\r\nSTAT curr_items {}\r\nEND\r\n",
                options.version,
                items.len()
            )
            .into_bytes(),
            Some("items") => b"STAT items:1:number 2\r\nSTAT items:1:age 10\r\nEND\r\n".to_vec(),
            Some("slabs") => {
                b"STAT 1:chunk_size 96\r\nSTAT 1:used_chunks 2\r\nSTAT active_slabs 1\r\nEND\r\n".to_vec()
            }
            Some("sizes") => b"STAT 96 2\r\nEND\r\n".to_vec(),
            Some(_) => b"STAT other 1\r\nEND\r\n".to_vec(),
        },
        _ => b"ERROR\r\n".to_vec(),
    };
    Some(reply)
}
