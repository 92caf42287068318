//! Protocol constants
//!
//! Wire-level values of the ASI protocol. Widths and sentinels are protocol
//! constants shared with every host implementation and are not tunable.

// ============================================================================
// Command Channel (host → device)
// ============================================================================

/// Start-of-frame marker for an ASCII command.
pub const COMMAND_START_MARKER: u8 = b'<';
/// End-of-frame marker for an ASCII command.
pub const COMMAND_END_MARKER: u8 = b'>';
/// Size of the command accumulation buffer, terminator slot included.
pub const COMMAND_BUFFER_SIZE: usize = 64;
/// Number of integer parameters carried by every command.
pub const COMMAND_PARAM_COUNT: usize = 10;
/// Maximum length of the string field taken from the first parameter token.
pub const COMMAND_STRING_MAX_LEN: usize = 15;
/// Characters that separate command tokens.
pub const COMMAND_DELIMITERS: &[char] = &[',', ' '];

/// Request the symbol list.
pub const CMD_GET_SIGNAL_LIST: &str = "LOGGING_GETSIGNALLIST";
/// Request a single data telegram.
pub const CMD_GET_DATA: &str = "LOGGING_GETDATA";
/// Start periodic data telegrams.
pub const CMD_ACTIVATE: &str = "LOGGING_ACTIVATE";
/// Stop periodic data telegrams.
pub const CMD_DEACTIVATE: &str = "LOGGING_DEACTIVATE";

// ============================================================================
// Telegrams (device → host)
// ============================================================================

/// Magic tag opening every telegram.
pub const TELEGRAM_MAGIC: &[u8; 5] = b"#ASI:";
/// Field separator in the telegram header.
pub const TELEGRAM_SEPARATOR: u8 = b':';
/// Trailer closing a terminal telegram.
pub const TELEGRAM_TRAILER: &[u8; 10] = b"ENDOFASI\r\n";
/// Header length: magic, kind, separator, message id, separator.
pub const TELEGRAM_HEADER_LEN: usize = TELEGRAM_MAGIC.len() + 1 + 1 + 4 + 1;

/// Symbol-list telegram kind.
pub const KIND_SYMBOLS: u8 = 0xB0;
/// Data telegram kind.
pub const KIND_DATA: u8 = 0xB1;

// ============================================================================
// Logging Scheduler
// ============================================================================

/// Upper bound for the `LOGGING_ACTIVATE` interval, in seconds.
pub const LOGGING_MAX_INTERVAL_S: u32 = 32767;
/// Scale from the `LOGGING_ACTIVATE` unit to milliseconds.
pub const LOGGING_UNIT_MS: u64 = 1000;
/// Interval used when activation requests zero.
pub const LOGGING_MIN_INTERVAL_MS: u64 = 100;
/// Interval used before anything is configured.
pub const LOGGING_DEFAULT_INTERVAL_MS: u64 = 1000;

// ============================================================================
// Bus Aggregation
// ============================================================================

/// Highest 7-bit bus address.
pub const BUS_MAX_ADDRESS: u8 = 127;
/// Probe attempts per address before it is treated as absent.
pub const BUS_PROBE_ATTEMPTS: usize = 4;
/// Bytes requested from a subordinate per burst.
pub const BUS_BURST_SIZE: usize = 32;
/// Maximum bursts polled from one subordinate in one pass.
pub const BUS_MAX_BURSTS: usize = 1000;
/// Bursts shorter than this are ignored and polled again.
pub const BUS_MIN_BURST_LEN: usize = 2;

/// Probe byte requesting the symbol list.
pub const BUS_REQUEST_SYMBOLS: u8 = 0x00;
/// Probe byte requesting data.
pub const BUS_REQUEST_DATA: u8 = 0x01;
/// First byte of a subordinate's symbol-list response.
pub const BUS_HANDSHAKE: u8 = 0xAA;
/// Terminates one signal's metadata on the bus.
pub const BUS_END_OF_SIGNAL: u8 = 0x0D;
/// Terminates a subordinate's symbol list.
pub const BUS_END_OF_LIST: u8 = 0x0A;
/// Repeated to terminate a subordinate's data.
pub const BUS_END_OF_DATA: u8 = 0x7F;
/// Number of consecutive [`BUS_END_OF_DATA`] bytes terminating data.
pub const BUS_END_OF_DATA_RUN: usize = 8;

/// Longest signal name a subordinate puts on the bus.
///
/// The first symbol response must fit handshake, name, NUL, type tag and both
/// sentinels into one burst.
pub const BUS_MAX_NAME_LEN: usize = BUS_BURST_SIZE - 5;
