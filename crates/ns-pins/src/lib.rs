//! Pin registry and payload encoder (C3).
//!
//! A pin's name carries its kind in the first character and a numeric
//! index in the remainder (`X20`, `D5`, `T0`). Parsing follows the
//! same field-by-field, reject-early style as a fixed-width protocol
//! frame parser: nothing here tries to be lenient about malformed
//! tokens beyond what §4.3 documents (unknown/empty tokens are simply
//! skipped, not treated as a hard parse failure).

use std::collections::HashSet;
use std::io::{self, Read};
use std::pin::Pin as StdPin;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Pin
// ---------------------------------------------------------------------------

/// A named I/O endpoint. `value == -1` means "not produced yet / failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    pub name: String,
    pub value: i32,
    pub data: Option<Vec<u8>>,
    pub mime_type: Option<String>,
}

pub const UNSET: i32 = -1;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

impl Pin {
    pub fn unset(name: impl Into<String>) -> Self {
        Pin {
            name: name.into(),
            value: UNSET,
            data: None,
            mime_type: None,
        }
    }

    /// The leading kind character, e.g. `'X'` for `"X20"`.
    pub fn kind(&self) -> char {
        self.name.chars().next().unwrap_or('\0')
    }

    /// Invariant 1: `value >= 0` implies `data` is either absent or exactly
    /// `value` bytes long.
    pub fn satisfies_length_invariant(&self) -> bool {
        if self.value < 0 {
            return true;
        }
        match &self.data {
            None => true,
            Some(d) => d.len() as i64 == i64::from(self.value),
        }
    }

    pub fn set_data(&mut self, data: Vec<u8>, mime_type: Option<String>) {
        self.value = data.len() as i32;
        self.mime_type = Some(mime_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_owned()));
        self.data = Some(data);
    }
}

// ---------------------------------------------------------------------------
// Pin name parsing / MakePins
// ---------------------------------------------------------------------------

/// Parse a single pin name into its kind character, rejecting anything
/// that does not fit `<letter><digits>`.
fn parse_pin_name(name: &str) -> Option<char> {
    let mut chars = name.chars();
    let kind = chars.next()?;
    if !kind.is_ascii_alphabetic() {
        return None;
    }
    let rest = chars.as_str();
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(kind)
}

/// Parse a comma-separated pin name list, optionally restricted to a set
/// of leading-character kinds (itself a comma-separated list, e.g. `"X,V"`;
/// an empty string means no restriction).
///
/// Unknown or empty tokens are skipped. Duplicate names: first wins (an
/// explicit choice where the observed behavior was unspecified — see
/// `DESIGN.md`).
pub fn make_pins(csv: &str, restrict: &str) -> Vec<Pin> {
    let allowed: Option<HashSet<char>> = if restrict.trim().is_empty() {
        None
    } else {
        Some(
            restrict
                .split(',')
                .filter_map(|s| s.trim().chars().next())
                .collect(),
        )
    };

    let mut seen = HashSet::new();
    let mut pins = Vec::new();
    for token in csv.split(',') {
        let name = token.trim();
        if name.is_empty() {
            continue;
        }
        let Some(kind) = parse_pin_name(name) else {
            continue;
        };
        if let Some(allowed) = &allowed {
            if !allowed.contains(&kind) {
                continue;
            }
        }
        if !seen.insert(name.to_owned()) {
            continue;
        }
        pins.push(Pin::unset(name));
    }
    pins
}

// ---------------------------------------------------------------------------
// Handler contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pin handler error: {}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// Called before the outgoing poll request is built. May be slow, but
/// implementers are expected to respect the loop's overall deadline.
pub trait PinReader: Send + Sync {
    fn read(&self, pin: &mut Pin) -> Result<(), HandlerError>;
}

/// Called once per output pin named in a poll/vars reply.
pub trait PinWriter: Send + Sync {
    fn write(&self, pin: &Pin) -> Result<(), HandlerError>;
}

/// A multi-cycle binary/bulk reader. Returns `Ok(true)` once the sample is
/// ready (pin populated), `Ok(false)` to signal "not ready, retry next
/// cycle" without touching the pin's value.
pub trait BulkReader: Send + Sync {
    fn read_bulk(&self, pin: &mut Pin) -> Result<bool, HandlerError>;
}

/// Optional handler hooks, held by a single owner and passed in at
/// construction — no mutable globals, no function-pointer assignment
/// before init.
#[derive(Clone, Default)]
pub struct PinHandlers {
    pub init: Option<Arc<dyn Fn(&mut Pin) + Send + Sync>>,
    readers: std::collections::HashMap<char, Arc<dyn PinReader>>,
    writers: std::collections::HashMap<char, Arc<dyn PinWriter>>,
    bulk: std::collections::HashMap<char, Arc<dyn BulkReader>>,
}

impl std::fmt::Debug for PinHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinHandlers")
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("writers", &self.writers.keys().collect::<Vec<_>>())
            .field("bulk", &self.bulk.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PinHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reader(mut self, kind: char, handler: Arc<dyn PinReader>) -> Self {
        self.readers.insert(kind, handler);
        self
    }

    pub fn with_writer(mut self, kind: char, handler: Arc<dyn PinWriter>) -> Self {
        self.writers.insert(kind, handler);
        self
    }

    pub fn with_bulk_reader(mut self, kind: char, handler: Arc<dyn BulkReader>) -> Self {
        self.bulk.insert(kind, handler);
        self
    }

    /// Run exactly one handler for `pin`, preferring a bulk reader over a
    /// plain reader when both are registered for its kind — bulk readers
    /// are the specialized case (§4.3's "binary/bulk readers keyed by
    /// leading character"). Errors are logged by the caller; the pin is
    /// left at `UNSET` so the cycle can continue.
    pub fn dispatch_read(&self, pin: &mut Pin) -> Result<(), HandlerError> {
        if let Some(init) = &self.init {
            init(pin);
        }
        let kind = pin.kind();
        if let Some(bulk) = self.bulk.get(&kind) {
            match bulk.read_bulk(pin) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    pin.value = UNSET;
                    return Ok(());
                }
                Err(e) => {
                    pin.value = UNSET;
                    return Err(e);
                }
            }
        }
        if let Some(reader) = self.readers.get(&kind) {
            if let Err(e) = reader.read(pin) {
                pin.value = UNSET;
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn dispatch_write(&self, pin: &Pin) -> Result<(), HandlerError> {
        if let Some(writer) = self.writers.get(&pin.kind()) {
            writer.write(pin)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Streaming payload reader
// ---------------------------------------------------------------------------

/// Concatenates the `data` of every pin with `value > 0`, in pin-list
/// order, without ever materializing the full concatenation. State is a
/// `(pin_index, byte_offset)` cursor, per §9's design note.
///
/// Owns its pins via `Arc<[Pin]>` rather than borrowing, so it can be
/// `'static` and handed to `tokio_util::io::ReaderStream` for streaming
/// into an HTTP body instead of being read to completion into a buffer.
pub struct PayloadReader {
    pins: Arc<[Pin]>,
    pin_index: usize,
    byte_offset: usize,
}

impl PayloadReader {
    pub fn new(pins: &[Pin]) -> Self {
        PayloadReader {
            pins: Arc::from(pins),
            pin_index: 0,
            byte_offset: 0,
        }
    }

    fn current_chunk(&self) -> Option<&[u8]> {
        self.pins.get(self.pin_index).and_then(|pin| {
            if pin.value > 0 {
                pin.data.as_deref()
            } else {
                None
            }
        })
    }

    /// Shared cursor-advance logic behind both the sync and async `Read`
    /// impls. Returns the number of bytes written into `buf`.
    fn fill(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            let Some(chunk) = self.current_chunk() else {
                if self.pin_index >= self.pins.len() {
                    return 0;
                }
                self.pin_index += 1;
                self.byte_offset = 0;
                continue;
            };
            if self.byte_offset >= chunk.len() {
                self.pin_index += 1;
                self.byte_offset = 0;
                continue;
            }
            let remaining = &chunk[self.byte_offset..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.byte_offset += n;
            return n;
        }
    }
}

impl Read for PayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.fill(buf))
    }
}

impl tokio::io::AsyncRead for PayloadReader {
    fn poll_read(
        mut self: StdPin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        let n = self.fill(buf.initialize_unfilled());
        buf.advance(n);
        std::task::Poll::Ready(Ok(()))
    }
}
