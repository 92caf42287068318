//! Telegram encoding and decoding.
//!
//! Every telegram shares one header; a terminal telegram ends with the
//! `ENDOFASI\r\n` trailer.
//!
//! ```text
//! +-------+------+-----+--------------+-----+-----------+---------------+
//! | #ASI: | kind |  :  | msg id (LE4) |  :  | entries.. | ENDOFASI\r\n  |
//! +-------+------+-----+--------------+-----+-----------+---------------+
//!
//! symbol entry (0xB0):  index (LE2) | name | 0x00 | type tag
//! data entry   (0xB1):  index (LE2) | value (LE, width by type)
//! ```
//!
//! Encoding writes straight into a [`ByteSink`] and never allocates.

use std::collections::HashMap;

use asi_metrics::{metric_defs, metrics};
use bytes::{Buf, BytesMut};
use serde::Serialize;

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};
use crate::registry::SignalRegistry;
use crate::transport::{ByteSink, CountingSink};
use crate::types::{SignalType, SignalValue};

/// Longest symbol name the decoder waits for before giving up on a telegram.
pub const MAX_DECODED_NAME_LEN: usize = 255;

/// The two telegram kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelegramKind {
    /// Symbol list (`0xB0`).
    Symbols,
    /// Data values (`0xB1`).
    Data,
}

impl TelegramKind {
    /// Kind byte in the header.
    pub const fn code(self) -> u8 {
        match self {
            TelegramKind::Symbols => KIND_SYMBOLS,
            TelegramKind::Data => KIND_DATA,
        }
    }

    /// Parse a header kind byte.
    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        match code {
            KIND_SYMBOLS => Ok(TelegramKind::Symbols),
            KIND_DATA => Ok(TelegramKind::Data),
            other => Err(ProtocolError::UnknownTelegramKind(other)),
        }
    }

    /// Lowercase name used in logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            TelegramKind::Symbols => "symbols",
            TelegramKind::Data => "data",
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Write the common header.
pub fn write_header<S: ByteSink + ?Sized>(sink: &mut S, kind: TelegramKind, message_id: u32) {
    sink.write_all(TELEGRAM_MAGIC);
    sink.write_all(&[kind.code(), TELEGRAM_SEPARATOR]);
    sink.write_all(&message_id.to_le_bytes());
    sink.write_all(&[TELEGRAM_SEPARATOR]);
}

/// Write one symbol-list entry.
pub fn write_symbol_entry<S: ByteSink + ?Sized>(
    sink: &mut S,
    index: u16,
    name: &[u8],
    signal_type: SignalType,
) {
    sink.write_all(&index.to_le_bytes());
    sink.write_all(name);
    sink.write_all(&[0x00, signal_type.tag()]);
}

/// Write one data entry.
pub fn write_data_entry<S: ByteSink + ?Sized>(sink: &mut S, index: u16, value: &SignalValue) {
    let (buf, width) = value.to_wire();
    sink.write_all(&index.to_le_bytes());
    sink.write_all(&buf[..width]);
}

/// Write the terminal trailer.
pub fn write_trailer<S: ByteSink + ?Sized>(sink: &mut S) {
    sink.write_all(TELEGRAM_TRAILER);
}

/// Encode the registry's symbol list, then flush.
///
/// With `terminal` false the trailer is left off so more entries (relayed
/// from subordinates) can follow. Returns the number of bytes written.
pub fn encode_symbols<S: ByteSink + ?Sized>(
    registry: &SignalRegistry,
    message_id: u32,
    terminal: bool,
    sink: &mut S,
) -> usize {
    let mut out = CountingSink::new(sink);
    write_header(&mut out, TelegramKind::Symbols, message_id);
    write_symbol_entries(registry, &mut out);
    finish(&mut out, TelegramKind::Symbols, terminal)
}

/// Encode the current value of every signal, then flush.
pub fn encode_data<S: ByteSink + ?Sized>(
    registry: &SignalRegistry,
    message_id: u32,
    terminal: bool,
    sink: &mut S,
) -> usize {
    let mut out = CountingSink::new(sink);
    write_header(&mut out, TelegramKind::Data, message_id);
    write_data_entries(registry, &mut out);
    finish(&mut out, TelegramKind::Data, terminal)
}

/// Write a symbol entry for every registered signal.
pub(crate) fn write_symbol_entries<S: ByteSink + ?Sized>(registry: &SignalRegistry, sink: &mut S) {
    for (index, signal) in registry.iter().enumerate() {
        write_symbol_entry(sink, index as u16, signal.name().as_bytes(), signal.signal_type());
    }
}

/// Write a data entry for every registered signal.
pub(crate) fn write_data_entries<S: ByteSink + ?Sized>(registry: &SignalRegistry, sink: &mut S) {
    for (index, signal) in registry.iter().enumerate() {
        write_data_entry(sink, index as u16, &signal.read());
    }
}

/// Close a telegram written piecewise (trailer if terminal), flush and count it.
pub(crate) fn finish<S: ByteSink + ?Sized>(
    out: &mut CountingSink<'_, S>,
    kind: TelegramKind,
    terminal: bool,
) -> usize {
    if terminal {
        write_trailer(out);
    }
    out.flush();

    metrics::counter!(
        metric_defs::TELEGRAM_SENT.name,
        "kind" => kind.as_str(),
        "terminal" => if terminal { "true" } else { "false" }
    )
    .increment(1);
    metrics::counter!(metric_defs::TELEGRAM_BYTES.name, "kind" => kind.as_str())
        .increment(out.written as u64);
    log::trace!(
        "telegram {} written: {} bytes, terminal={}",
        kind.as_str(),
        out.written,
        terminal
    );
    out.written
}

// ============================================================================
// Decoding
// ============================================================================

/// One entry of a symbol-list telegram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolEntry {
    pub index: u16,
    pub name: String,
    pub signal_type: SignalType,
}

/// One entry of a data telegram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataEntry {
    pub index: u16,
    pub value: SignalValue,
}

/// A decoded telegram.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Telegram {
    /// Names and types of every signal.
    Symbols {
        message_id: u32,
        entries: Vec<SymbolEntry>,
    },
    /// Current values, indexed like the last symbol list.
    Data {
        message_id: u32,
        entries: Vec<DataEntry>,
    },
}

impl Telegram {
    /// Message id from the header.
    pub fn message_id(&self) -> u32 {
        match self {
            Telegram::Symbols { message_id, .. } | Telegram::Data { message_id, .. } => {
                *message_id
            }
        }
    }

    /// Which kind of telegram this is.
    pub fn kind(&self) -> TelegramKind {
        match self {
            Telegram::Symbols { .. } => TelegramKind::Symbols,
            Telegram::Data { .. } => TelegramKind::Data,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            Telegram::Symbols { entries, .. } => entries.len(),
            Telegram::Data { entries, .. } => entries.len(),
        }
    }

    /// Whether the telegram carries no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Parse {
    Incomplete,
    Complete(Telegram, usize),
}

/// Host-side decoder for a device's output stream.
///
/// Bytes before a telegram's magic (command echoes, line noise) are skipped.
/// Data telegrams are decoded against the types of the last symbol list seen
/// (or supplied with [`TelegramDecoder::with_symbols`]).
#[derive(Debug, Default)]
pub struct TelegramDecoder {
    buffer: BytesMut,
    types: HashMap<u16, SignalType>,
}

impl TelegramDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the type table, e.g. from a cached symbol list.
    pub fn with_symbols<'a>(mut self, entries: impl IntoIterator<Item = &'a SymbolEntry>) -> Self {
        self.learn(entries);
        self
    }

    /// Add received data to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Try to decode the next complete telegram.
    ///
    /// Returns `None` when more data is needed. On an error the offending
    /// telegram start is skipped so the next call resynchronises.
    pub fn decode(&mut self) -> Option<ProtocolResult<Telegram>> {
        match find(&self.buffer, TELEGRAM_MAGIC) {
            Some(start) => self.buffer.advance(start),
            None => {
                // Keep a tail that may be the start of a split magic.
                let keep = (TELEGRAM_MAGIC.len() - 1).min(self.buffer.len());
                let drop = self.buffer.len() - keep;
                self.buffer.advance(drop);
                return None;
            }
        }

        match parse_telegram(&self.buffer, &self.types) {
            Ok(Parse::Incomplete) => None,
            Ok(Parse::Complete(telegram, consumed)) => {
                self.buffer.advance(consumed);
                if let Telegram::Symbols { entries, .. } = &telegram {
                    self.types.clear();
                    self.learn(entries.iter());
                }
                Some(Ok(telegram))
            }
            Err(e) => {
                self.buffer.advance(1);
                Some(Err(e))
            }
        }
    }

    /// Decode every complete telegram currently buffered.
    pub fn decode_all(&mut self) -> Vec<ProtocolResult<Telegram>> {
        std::iter::from_fn(|| self.decode()).collect()
    }

    fn learn<'a>(&mut self, entries: impl IntoIterator<Item = &'a SymbolEntry>) {
        for entry in entries {
            self.types.insert(entry.index, entry.signal_type);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_telegram(buf: &[u8], types: &HashMap<u16, SignalType>) -> ProtocolResult<Parse> {
    if buf.len() < TELEGRAM_HEADER_LEN {
        return Ok(Parse::Incomplete);
    }
    let kind = TelegramKind::from_code(buf[5])?;
    if buf[6] != TELEGRAM_SEPARATOR || buf[11] != TELEGRAM_SEPARATOR {
        return Err(ProtocolError::InvalidTelegram(
            "missing header separator".to_string(),
        ));
    }
    let message_id = u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]);

    let mut pos = TELEGRAM_HEADER_LEN;
    let mut symbols = Vec::new();
    let mut data = Vec::new();
    loop {
        let rest = &buf[pos..];
        if rest.starts_with(TELEGRAM_TRAILER) {
            pos += TELEGRAM_TRAILER.len();
            break;
        }
        if rest.len() < 2 || TELEGRAM_TRAILER.starts_with(rest) {
            return Ok(Parse::Incomplete);
        }
        let index = u16::from_le_bytes([rest[0], rest[1]]);
        let body = &rest[2..];

        match kind {
            TelegramKind::Symbols => {
                let Some(nul) = body.iter().position(|&b| b == 0) else {
                    if body.len() > MAX_DECODED_NAME_LEN {
                        return Err(ProtocolError::InvalidTelegram(format!(
                            "symbol {} name not terminated",
                            index
                        )));
                    }
                    return Ok(Parse::Incomplete);
                };
                let Some(&tag) = body.get(nul + 1) else {
                    return Ok(Parse::Incomplete);
                };
                symbols.push(SymbolEntry {
                    index,
                    name: String::from_utf8_lossy(&body[..nul]).into_owned(),
                    signal_type: SignalType::from_tag(tag)?,
                });
                pos += 2 + nul + 2;
            }
            TelegramKind::Data => {
                let ty = *types
                    .get(&index)
                    .ok_or(ProtocolError::UnknownSignalIndex(index))?;
                if body.len() < ty.width() {
                    return Ok(Parse::Incomplete);
                }
                data.push(DataEntry {
                    index,
                    value: SignalValue::from_wire(ty, &body[..ty.width()])?,
                });
                pos += 2 + ty.width();
            }
        }
    }

    let telegram = match kind {
        TelegramKind::Symbols => Telegram::Symbols {
            message_id,
            entries: symbols,
        },
        TelegramKind::Data => Telegram::Data {
            message_id,
            entries: data,
        },
    };
    Ok(Parse::Complete(telegram, pos))
}
