//! # Text Protocol Codec
//!
//! Purpose: Serialize commands into CRLF-terminated text lines (with an
//! optional length-prefixed data block) and incrementally parse replies from
//! a byte buffer that may hold a partial frame.
//!
//! ## Design Principles
//! 1. **Stateless Decoding**: A decoder sees the whole unconsumed buffer every
//!    time; if the frame is incomplete it says so and keeps no partial state.
//!    The next attempt restarts from the first line.
//! 2. **Explicit Framing**: Every complete decode reports exactly how many
//!    bytes it consumed, so pipelined replies can be peeled off one by one.
//! 3. **Binary-Safe Values**: Value blocks are sliced by their declared length,
//!    never by searching for a terminator.
//! 4. **Desync Detection**: Replies that cannot be delimited are reported as
//!    `Malformed` instead of being guessed at.
//!
//! ## Wire Format
//!
//! ```text
//! set <key> <flags> <exptime> <bytes> [<cas>]\r\n<data>\r\n   -> STORED\r\n
//! get <key>*\r\n  -> (VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\n)* END\r\n
//! incr <key> <delta>\r\n                                   -> <number>\r\n
//! stats [items|slabs|sizes]\r\n         -> (STAT <name> <value>\r\n)* END\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::adapter::{Adapter, Item};
use crate::error::{ErrorKind, McError, McResult};
use crate::types::{
    CounterVerb, Entry, RetrieveVerb, StatsKind, StatsRecord, StoreVerb, Values,
};

/// Line terminator used by every frame.
pub const CRLF: &[u8] = b"\r\n";

/// Prefix of the generic error line that aborts any pending request.
pub const ERROR_PREFIX: &str = "ERROR";

const END: &str = "END";
const VALUE_PREFIX: &str = "VALUE";
const STAT_PREFIX: &str = "STAT ";
const ITEMS_PREFIX: &str = "items:";
const VERSION_PREFIX: &str = "VERSION ";
const CLIENT_ERROR_PREFIX: &str = "CLIENT_ERROR";
const SERVER_ERROR_PREFIX: &str = "SERVER_ERROR";

/// One CRLF-terminated line located in a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Line contents without the terminator (lossy UTF-8).
    pub text: String,
    /// Offset of the first byte after the terminator.
    pub next: usize,
}

/// Finds the next complete line starting at `start`.
///
/// Returns `None` when no terminator has arrived yet.
pub fn read_line(buf: &[u8], start: usize) -> Option<Line> {
    if start >= buf.len() {
        return None;
    }
    let offset = memchr::memmem::find(&buf[start..], CRLF)?;
    let end = start + offset;
    Some(Line {
        text: String::from_utf8_lossy(&buf[start..end]).into_owned(),
        next: end + CRLF.len(),
    })
}

/// Decoded reply payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// One-line confirmation such as `STORED` or `DELETED`.
    Line(String),
    /// Result of `incr`/`decr`.
    Number(u64),
    Version(String),
    /// Fetched entries keyed by key.
    Values(Values),
    Stats(StatsRecord),
}

impl Response {
    pub fn into_line(self) -> McResult<String> {
        match self {
            Response::Line(line) => Ok(line),
            other => Err(unexpected("line", &other)),
        }
    }

    pub fn into_number(self) -> McResult<u64> {
        match self {
            Response::Number(value) => Ok(value),
            other => Err(unexpected("number", &other)),
        }
    }

    pub fn into_version(self) -> McResult<String> {
        match self {
            Response::Version(version) => Ok(version),
            other => Err(unexpected("version", &other)),
        }
    }

    pub fn into_values(self) -> McResult<Values> {
        match self {
            Response::Values(values) => Ok(values),
            other => Err(unexpected("values", &other)),
        }
    }

    pub fn into_stats(self) -> McResult<StatsRecord> {
        match self {
            Response::Stats(stats) => Ok(stats),
            other => Err(unexpected("stats", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> McError {
    McError::protocol(format!("expected {} reply, got {:?}", expected, got))
}

/// Outcome of one decode attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// The frame is not complete; wait for more bytes.
    Incomplete,
    /// A full frame of `consumed` bytes was decoded into `result`.
    Complete {
        consumed: usize,
        result: McResult<Response>,
    },
    /// The bytes cannot be delimited as a reply to this request.
    Malformed { reason: String },
}

impl ParseResult {
    fn complete(consumed: usize, result: McResult<Response>) -> Self {
        ParseResult::Complete { consumed, result }
    }
}

/// Reply decoder chosen when a command is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decoder {
    /// Store and delete family.
    Minimal,
    /// `incr` / `decr`.
    Numeric,
    Version,
    /// `get` / `gets`, single or multi key.
    Get,
    Stats,
    ItemsStats,
    SlabsStats,
    SizesStats,
}

impl Decoder {
    pub fn for_stats(kind: &StatsKind) -> Self {
        match kind {
            StatsKind::Items => Decoder::ItemsStats,
            StatsKind::Slabs => Decoder::SlabsStats,
            StatsKind::Sizes => Decoder::SizesStats,
            StatsKind::General | StatsKind::Other(_) => Decoder::Stats,
        }
    }

    /// Decodes the reply starting at offset 0 of `buf`.
    ///
    /// `line` is the first line of `buf`, already located by the caller.
    pub fn decode(&self, line: &Line, buf: &[u8], adapter: &Adapter) -> ParseResult {
        match self {
            Decoder::Minimal => decode_minimal(line),
            Decoder::Numeric => decode_numeric(line),
            Decoder::Version => decode_version(line),
            Decoder::Get => decode_get(line, buf, adapter),
            Decoder::Stats => decode_stats(line, buf, StatsLayout::Flat),
            Decoder::ItemsStats => decode_stats(line, buf, StatsLayout::Items),
            Decoder::SlabsStats => decode_stats(line, buf, StatsLayout::Slabs),
            Decoder::SizesStats => decode_stats(line, buf, StatsLayout::Sizes),
        }
    }
}

/// Command ready to be written: a text line, an optional data block and the
/// decoder for its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub decoder: Decoder,
    pub line: String,
    pub value: Option<Bytes>,
}

impl Request {
    /// `<verb> <key> <flags> <exptime> <bytes> [<cas>]` followed by the data block.
    pub fn store(
        verb: StoreVerb,
        key: &str,
        flags: u32,
        exptime: u32,
        cas: Option<u64>,
        value: Bytes,
    ) -> Self {
        let mut line = format!("{} {} {} {} {}", verb, key, flags, exptime, value.len());
        if let Some(token) = cas {
            line.push(' ');
            line.push_str(&token.to_string());
        }
        Request {
            decoder: Decoder::Minimal,
            line,
            value: Some(value),
        }
    }

    /// `get`/`gets` for one or more keys on a single line.
    pub fn retrieve<S: AsRef<str>>(verb: RetrieveVerb, keys: &[S]) -> Self {
        let mut line = String::from(verb.as_str());
        for key in keys {
            line.push(' ');
            line.push_str(key.as_ref());
        }
        Request {
            decoder: Decoder::Get,
            line,
            value: None,
        }
    }

    pub fn counter(verb: CounterVerb, key: &str, delta: u64) -> Self {
        Request {
            decoder: Decoder::Numeric,
            line: format!("{} {} {}", verb.as_str(), key, delta),
            value: None,
        }
    }

    pub fn delete(key: &str) -> Self {
        Request {
            decoder: Decoder::Minimal,
            line: format!("delete {}", key),
            value: None,
        }
    }

    pub fn version() -> Self {
        Request {
            decoder: Decoder::Version,
            line: "version".to_string(),
            value: None,
        }
    }

    pub fn stats(kind: &StatsKind) -> Self {
        let line = match kind.as_str() {
            "" => "stats".to_string(),
            sub => format!("stats {}", sub),
        };
        Request {
            decoder: Decoder::for_stats(kind),
            line,
            value: None,
        }
    }

    /// Appends `line CRLF [value CRLF]` to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        encode_command(self.line.as_bytes(), self.value.as_deref(), out);
    }

    pub fn encoded_len(&self) -> usize {
        self.line.len() + CRLF.len() + self.value.as_ref().map_or(0, |v| v.len() + CRLF.len())
    }
}

/// Serializes a command line and optional data block.
pub fn encode_command(line: &[u8], value: Option<&[u8]>, out: &mut BytesMut) {
    out.reserve(line.len() + CRLF.len() + value.map_or(0, |v| v.len() + CRLF.len()));
    out.put_slice(line);
    out.put_slice(CRLF);
    if let Some(value) = value {
        out.put_slice(value);
        out.put_slice(CRLF);
    }
}

/// Maps `CLIENT_ERROR <msg>` / `SERVER_ERROR <msg>` lines to typed errors.
fn error_line(text: &str) -> Option<McError> {
    if let Some(rest) = text.strip_prefix(CLIENT_ERROR_PREFIX) {
        return Some(McError::new(ErrorKind::Client, rest.trim_start()));
    }
    if let Some(rest) = text.strip_prefix(SERVER_ERROR_PREFIX) {
        return Some(McError::new(ErrorKind::ServerError, rest.trim_start()));
    }
    None
}

fn decode_minimal(line: &Line) -> ParseResult {
    let text = line.text.as_str();
    let rejection = match text {
        "NOT_FOUND" => Some(ErrorKind::NotFound),
        "EXISTS" => Some(ErrorKind::Exists),
        "NOT_STORED" => Some(ErrorKind::NotStored),
        _ => None,
    };
    let result = match rejection {
        Some(kind) => Err(McError::new(kind, "Action Not Permitted")),
        None => match error_line(text) {
            Some(err) => Err(err),
            None => Ok(Response::Line(text.to_string())),
        },
    };
    ParseResult::complete(line.next, result)
}

fn decode_numeric(line: &Line) -> ParseResult {
    let text = line.text.as_str();
    let result = if text == "NOT_FOUND" {
        Err(McError::new(ErrorKind::NotFound, "Numeric Response Not Found"))
    } else if let Some(rest) = text.strip_prefix(CLIENT_ERROR_PREFIX) {
        Err(McError::new(ErrorKind::Client, rest.trim_start()))
    } else {
        text.trim()
            .parse::<u64>()
            .map(Response::Number)
            .map_err(|_| McError::protocol(format!("invalid numeric reply: {}", text)))
    };
    ParseResult::complete(line.next, result)
}

fn decode_version(line: &Line) -> ParseResult {
    let text = line.text.as_str();
    let version = text.strip_prefix(VERSION_PREFIX).unwrap_or(text);
    ParseResult::complete(line.next, Ok(Response::Version(version.to_string())))
}

struct ValueHeader<'a> {
    key: &'a str,
    flags: u32,
    size: usize,
    cas: Option<u64>,
}

fn parse_value_header(text: &str) -> Option<ValueHeader<'_>> {
    let mut parts = text.split_ascii_whitespace();
    if parts.next()? != VALUE_PREFIX {
        return None;
    }
    let key = parts.next()?;
    let flags = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    let cas = match parts.next() {
        Some(token) => Some(token.parse().ok()?),
        None => None,
    };
    Some(ValueHeader {
        key,
        flags,
        size,
        cas,
    })
}

fn decode_get(first: &Line, buf: &[u8], adapter: &Adapter) -> ParseResult {
    if let Some(err) = error_line(&first.text) {
        return ParseResult::complete(first.next, Err(err));
    }

    let mut values = Values::new();
    let mut line = first.clone();
    while line.text != END {
        let header = match parse_value_header(&line.text) {
            Some(header) => header,
            None => {
                return ParseResult::Malformed {
                    reason: format!("unexpected line in fetch reply: {:?}", line.text),
                }
            }
        };

        let start = line.next;
        let (end, terminated) = match start
            .checked_add(header.size)
            .and_then(|end| Some((end, end.checked_add(CRLF.len())?)))
        {
            Some(bounds) => bounds,
            None => {
                return ParseResult::Malformed {
                    reason: format!("value length overflow: {}", header.size),
                }
            }
        };
        // The whole reply is retried once the value and its terminator arrive.
        if terminated > buf.len() {
            return ParseResult::Incomplete;
        }
        if &buf[end..terminated] != CRLF {
            return ParseResult::Malformed {
                reason: format!("value for {:?} not terminated by CRLF", header.key),
            };
        }

        let item = Item {
            flags: header.flags,
            data: Bytes::copy_from_slice(&buf[start..end]),
        };
        values.insert(
            header.key.to_string(),
            Entry {
                value: adapter.apply(&item),
                flags: header.flags,
                cas: header.cas,
            },
        );

        line = match read_line(buf, end + CRLF.len()) {
            Some(next) => next,
            None => return ParseResult::Incomplete,
        };
    }

    let result = if values.is_empty() {
        Err(McError::new(ErrorKind::NotFound, "No Value Available"))
    } else {
        Ok(Response::Values(values))
    };
    ParseResult::complete(line.next, result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsLayout {
    /// `STAT <name> <value>` into `fields`.
    Flat,
    /// `STAT items:<slab>:<metric> <value>` into `slabs`.
    Items,
    /// `STAT <slab>:<metric> <value>` into `slabs`, anything else into `fields`.
    Slabs,
    /// A single `STAT <bytes> <items>` record.
    Sizes,
}

fn decode_stats(first: &Line, buf: &[u8], layout: StatsLayout) -> ParseResult {
    if let Some(err) = error_line(&first.text) {
        return ParseResult::complete(first.next, Err(err));
    }

    let mut records = Vec::new();
    let mut pos = 0;
    let consumed = loop {
        let line = match read_line(buf, pos) {
            Some(line) => line,
            None => return ParseResult::Incomplete,
        };
        if line.text == END {
            break line.next;
        }
        if let Some(record) = line.text.strip_prefix(STAT_PREFIX) {
            records.push(record.to_string());
        }
        pos = line.next;
    };

    let mut stats = StatsRecord::default();
    for record in &records {
        let (category, value) = record.split_once(' ').unwrap_or((record.as_str(), ""));
        match layout {
            StatsLayout::Flat => {
                stats.fields.insert(category.to_string(), value.to_string());
            }
            StatsLayout::Items => {
                if let Some(rest) = category.strip_prefix(ITEMS_PREFIX) {
                    insert_compound(&mut stats, rest, value);
                }
            }
            StatsLayout::Slabs => insert_compound(&mut stats, category, value),
            StatsLayout::Sizes => {
                if stats.fields.is_empty() {
                    stats.fields.insert("bytes".to_string(), category.to_string());
                    stats.fields.insert("items".to_string(), value.to_string());
                }
            }
        }
    }
    ParseResult::complete(consumed, Ok(Response::Stats(stats)))
}

/// Files `<slab>:<metric>` under its slab, anything else as a global field.
fn insert_compound(stats: &mut StatsRecord, category: &str, value: &str) {
    if let Some((slab, metric)) = category.split_once(':') {
        if let Ok(id) = slab.parse::<u32>() {
            stats.insert_slab(id, metric, value);
            return;
        }
    }
    stats.fields.insert(category.to_string(), value.to_string());
}
