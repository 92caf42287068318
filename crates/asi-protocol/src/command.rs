//! ASCII command framing and parsing.
//!
//! Commands arrive on the serial channel as `<NAME,P1,...,P10>`. The framer
//! accumulates bytes between the markers into a fixed buffer; the parser
//! splits the payload on `,` and space into the command name, a string field
//! and ten integer parameters.
//!
//! ```text
//! <LOGGING_GETDATA,7,0,0,0,0,0,0,0,0,0>
//!  |               | +---------------+-- params[1..10]
//!  |               +-- params[0], and the string field (first 15 chars)
//!  +-- name
//! ```

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};
use crate::transport::SerialPort;

/// Payload bytes a frame can hold; the last buffer slot is the terminator's.
const FRAME_CAPACITY: usize = COMMAND_BUFFER_SIZE - 1;

/// Extracts complete command frames from a byte stream.
///
/// Payloads longer than the buffer are truncated: once the cursor reaches the
/// last payload slot it stays there and later bytes overwrite that slot until
/// the end marker arrives. Such a frame still completes, flagged truncated.
#[derive(Debug)]
pub struct CommandFramer {
    buffer: [u8; FRAME_CAPACITY],
    cursor: usize,
    in_frame: bool,
    overflowed: bool,
    frame: [u8; FRAME_CAPACITY],
    frame_len: usize,
    frame_truncated: bool,
}

impl Default for CommandFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandFramer {
    /// Create an idle framer.
    pub fn new() -> Self {
        CommandFramer {
            buffer: [0; FRAME_CAPACITY],
            cursor: 0,
            in_frame: false,
            overflowed: false,
            frame: [0; FRAME_CAPACITY],
            frame_len: 0,
            frame_truncated: false,
        }
    }

    /// Feed one byte. Returns `true` when it completed a frame.
    pub fn push(&mut self, byte: u8) -> bool {
        if !self.in_frame {
            if byte == COMMAND_START_MARKER {
                self.in_frame = true;
                self.cursor = 0;
                self.overflowed = false;
            }
            return false;
        }

        if byte != COMMAND_END_MARKER {
            if self.cursor < FRAME_CAPACITY {
                self.buffer[self.cursor] = byte;
                self.cursor += 1;
            } else {
                self.buffer[FRAME_CAPACITY - 1] = byte;
                self.overflowed = true;
            }
            return false;
        }

        let len = self.cursor;
        self.frame[..len].copy_from_slice(&self.buffer[..len]);
        self.frame_len = len;
        self.frame_truncated = self.overflowed;
        self.in_frame = false;
        self.cursor = 0;
        self.overflowed = false;
        true
    }

    /// Read from `port` until a frame completes or no bytes remain.
    pub fn poll<P: SerialPort + ?Sized>(&mut self, port: &mut P) -> bool {
        while port.available() > 0 {
            let Some(byte) = port.read_byte() else {
                break;
            };
            if self.push(byte) {
                return true;
            }
        }
        false
    }

    /// Payload of the most recently completed frame.
    pub fn payload(&self) -> &[u8] {
        &self.frame[..self.frame_len]
    }

    /// Whether the most recent frame overflowed the buffer.
    pub fn was_truncated(&self) -> bool {
        self.frame_truncated
    }

    /// Whether a frame is currently being received.
    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    /// Parse the most recently completed frame.
    pub fn parse(&self) -> ProtocolResult<Command> {
        if self.frame_truncated {
            return Err(ProtocolError::malformed(format!(
                "frame exceeded {} bytes",
                FRAME_CAPACITY
            )));
        }
        Command::parse(self.payload())
    }
}

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name, e.g. `LOGGING_GETDATA`.
    pub name: String,
    /// The ten integer parameters.
    pub params: [i32; COMMAND_PARAM_COUNT],
    /// First parameter token verbatim, at most 15 characters.
    pub text: String,
}

impl Command {
    /// Build a command from integer parameters.
    pub fn new(name: impl Into<String>, params: [i32; COMMAND_PARAM_COUNT]) -> Self {
        Command {
            name: name.into(),
            params,
            text: params[0].to_string(),
        }
    }

    /// Build a command whose first parameter is a string.
    pub fn with_text(
        name: impl Into<String>,
        text: &str,
        params: [i32; COMMAND_PARAM_COUNT - 1],
    ) -> Self {
        let text: String = text.chars().take(COMMAND_STRING_MAX_LEN).collect();
        let mut all = [0i32; COMMAND_PARAM_COUNT];
        all[0] = parse_int(&text);
        all[1..].copy_from_slice(&params);
        Command {
            name: name.into(),
            params: all,
            text,
        }
    }

    /// Parse a frame payload (without the markers).
    pub fn parse(payload: &[u8]) -> ProtocolResult<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::malformed("payload is not valid UTF-8"))?;
        let mut tokens = text.split(COMMAND_DELIMITERS).filter(|t| !t.is_empty());

        let name = tokens
            .next()
            .ok_or_else(|| ProtocolError::malformed("empty frame"))?
            .to_string();

        let mut params = [0i32; COMMAND_PARAM_COUNT];
        let mut string_field = String::new();
        for (i, slot) in params.iter_mut().enumerate() {
            let token = tokens.next().ok_or_else(|| {
                ProtocolError::malformed(format!(
                    "{} expects {} parameters, got {}",
                    name, COMMAND_PARAM_COUNT, i
                ))
            })?;
            if i == 0 {
                string_field = token.chars().take(COMMAND_STRING_MAX_LEN).collect();
            }
            *slot = parse_int(token);
        }

        Ok(Command {
            name,
            params,
            text: string_field,
        })
    }

    /// Render the command as a framed line for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = String::with_capacity(COMMAND_BUFFER_SIZE);
        line.push(COMMAND_START_MARKER as char);
        line.push_str(&self.name);
        line.push(',');
        line.push_str(&self.text);
        for param in &self.params[1..] {
            line.push(',');
            line.push_str(&param.to_string());
        }
        line.push(COMMAND_END_MARKER as char);
        line.into_bytes()
    }
}

/// Decimal prefix parse: optional sign then digits, anything else yields 0.
fn parse_int(token: &str) -> i32 {
    let bytes = token.as_bytes();
    let (negative, digits) = match bytes.first() {
        Some(b'-') => (true, &bytes[1..]),
        Some(b'+') => (false, &bytes[1..]),
        _ => (false, bytes),
    };
    let mut value: i64 = 0;
    for &b in digits.iter().take_while(|b| b.is_ascii_digit()) {
        value = (value * 10 + (b - b'0') as i64).min(i32::MAX as i64 + 1);
    }
    if negative {
        value = -value;
    }
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Message id carried little-endian in the low bytes of params[0..4].
pub fn message_id_from_params(params: &[i32; COMMAND_PARAM_COUNT]) -> u32 {
    u32::from_le_bytes([
        params[0] as u8,
        params[1] as u8,
        params[2] as u8,
        params[3] as u8,
    ])
}

/// Inverse of [`message_id_from_params`].
pub fn message_id_to_params(message_id: u32) -> [i32; 4] {
    message_id.to_le_bytes().map(i32::from)
}

/// Commands the protocol core acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCommand {
    /// Emit a symbol-list telegram.
    GetSignalList { message_id: u32 },
    /// Emit a data telegram.
    GetData { message_id: u32 },
    /// Start periodic data telegrams every `interval_s` seconds (already clamped).
    Activate { interval_s: u32 },
    /// Stop periodic data telegrams.
    Deactivate,
    /// Anything else, handed to the application.
    Other(Command),
}

impl ProtocolCommand {
    /// Classify a parsed command.
    pub fn from_command(command: Command) -> Self {
        match command.name.as_str() {
            CMD_GET_SIGNAL_LIST => ProtocolCommand::GetSignalList {
                message_id: message_id_from_params(&command.params),
            },
            CMD_GET_DATA => ProtocolCommand::GetData {
                message_id: message_id_from_params(&command.params),
            },
            CMD_ACTIVATE => ProtocolCommand::Activate {
                interval_s: u32::try_from(command.params[0])
                    .map_or(LOGGING_MAX_INTERVAL_S, |s| s.min(LOGGING_MAX_INTERVAL_S)),
            },
            CMD_DEACTIVATE => ProtocolCommand::Deactivate,
            _ => ProtocolCommand::Other(command),
        }
    }

    /// Build the wire command.
    pub fn to_command(&self) -> Command {
        let mut params = [0i32; COMMAND_PARAM_COUNT];
        match self {
            ProtocolCommand::GetSignalList { message_id } => {
                params[..4].copy_from_slice(&message_id_to_params(*message_id));
                Command::new(CMD_GET_SIGNAL_LIST, params)
            }
            ProtocolCommand::GetData { message_id } => {
                params[..4].copy_from_slice(&message_id_to_params(*message_id));
                Command::new(CMD_GET_DATA, params)
            }
            ProtocolCommand::Activate { interval_s } => {
                params[0] = (*interval_s).min(i32::MAX as u32) as i32;
                Command::new(CMD_ACTIVATE, params)
            }
            ProtocolCommand::Deactivate => Command::new(CMD_DEACTIVATE, params),
            ProtocolCommand::Other(command) => command.clone(),
        }
    }

    /// The command name.
    pub fn name(&self) -> &str {
        match self {
            ProtocolCommand::GetSignalList { .. } => CMD_GET_SIGNAL_LIST,
            ProtocolCommand::GetData { .. } => CMD_GET_DATA,
            ProtocolCommand::Activate { .. } => CMD_ACTIVATE,
            ProtocolCommand::Deactivate => CMD_DEACTIVATE,
            ProtocolCommand::Other(command) => &command.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(framer: &mut CommandFramer, bytes: &[u8]) -> usize {
        bytes.iter().filter(|&&b| framer.push(b)).count()
    }

    #[test]
    fn test_full_command() {
        let mut framer = CommandFramer::new();
        assert_eq!(feed(&mut framer, b"<CMD,1,2,3,4,5,6,7,8,9,10>"), 1);

        let cmd = framer.parse().unwrap();
        assert_eq!(cmd.name, "CMD");
        assert_eq!(cmd.params, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(cmd.text, "1");
    }

    #[test]
    fn test_incomplete_frame_returns_false() {
        let mut framer = CommandFramer::new();
        assert_eq!(feed(&mut framer, b"<CMD,1,2"), 0);
        assert!(framer.in_frame());
        assert_eq!(feed(&mut framer, b",3,4,5,6,7,8,9,10>"), 1);
        assert_eq!(framer.parse().unwrap().params[9], 10);
    }

    #[test]
    fn test_garbage_before_start_marker_ignored() {
        let mut framer = CommandFramer::new();
        assert_eq!(feed(&mut framer, b"noise>>,<A,0,0,0,0,0,0,0,0,0,0>"), 1);
        assert_eq!(framer.parse().unwrap().name, "A");
    }

    #[test]
    fn test_space_delimiters_and_empty_tokens() {
        let cmd = Command::parse(b"SET  name,, 1 2 3 4 5 6 7 8 9").unwrap();
        assert_eq!(cmd.name, "SET");
        assert_eq!(cmd.text, "name");
        assert_eq!(cmd.params, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_string_field_is_truncated() {
        let cmd = Command::parse(b"NAME,abcdefghijklmnopqrst,0,0,0,0,0,0,0,0,0").unwrap();
        assert_eq!(cmd.text, "abcdefghijklmno");
        assert_eq!(cmd.params[0], 0);
    }

    #[test]
    fn test_missing_parameters_are_malformed() {
        let err = Command::parse(b"LOGGING_DEACTIVATE").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedCommand { .. }));
        let err = Command::parse(b"CMD,1,2,3").unwrap_err();
        assert!(err.to_string().contains("got 3"));
        assert!(Command::parse(b"").is_err());
        assert!(Command::parse(b" , ,").is_err());
    }

    #[test]
    fn test_invalid_numbers_parse_as_zero_or_prefix() {
        assert_eq!(parse_int("abc"), 0);
        assert_eq!(parse_int("12abc"), 12);
        assert_eq!(parse_int("-7"), -7);
        assert_eq!(parse_int("+7"), 7);
        assert_eq!(parse_int("99999999999"), i32::MAX);
        assert_eq!(parse_int("-99999999999"), i32::MIN);
    }

    #[test]
    fn test_overlong_payload_truncates_then_recovers() {
        let mut framer = CommandFramer::new();
        let mut long = vec![b'<'];
        long.extend(std::iter::repeat(b'X').take(200));
        long.push(b'>');
        assert_eq!(feed(&mut framer, &long), 1);
        assert!(framer.was_truncated());
        assert_eq!(framer.payload().len(), COMMAND_BUFFER_SIZE - 1);
        assert!(matches!(
            framer.parse(),
            Err(ProtocolError::MalformedCommand { .. })
        ));

        assert_eq!(feed(&mut framer, b"<NEXT,1,2,3,4,5,6,7,8,9,10>"), 1);
        assert!(!framer.was_truncated());
        let cmd = framer.parse().unwrap();
        assert_eq!(cmd.name, "NEXT");
        assert_eq!(cmd.params, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_truncation_keeps_last_byte_before_end_marker() {
        let mut framer = CommandFramer::new();
        let mut long = vec![b'<'];
        long.extend(std::iter::repeat(b'a').take(70));
        long.push(b'Z');
        long.push(b'>');
        feed(&mut framer, &long);
        let payload = framer.payload();
        assert_eq!(payload.len(), COMMAND_BUFFER_SIZE - 1);
        assert_eq!(payload[payload.len() - 1], b'Z');
    }

    #[test]
    fn test_exactly_full_payload_is_not_truncated() {
        let mut framer = CommandFramer::new();
        let mut frame = vec![b'<'];
        frame.extend(std::iter::repeat(b'b').take(COMMAND_BUFFER_SIZE - 1));
        frame.push(b'>');
        feed(&mut framer, &frame);
        assert!(!framer.was_truncated());
        assert_eq!(framer.payload().len(), COMMAND_BUFFER_SIZE - 1);
    }

    #[test]
    fn test_encode_round_trips() {
        let cmd = Command::with_text("SETNAME", "pump_1", [1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let line = cmd.encode();
        assert_eq!(line, b"<SETNAME,pump_1,1,2,3,4,5,6,7,8,9>".to_vec());

        let mut framer = CommandFramer::new();
        assert_eq!(feed(&mut framer, &line), 1);
        assert_eq!(framer.parse().unwrap(), cmd);
    }

    #[test]
    fn test_message_id_bytes() {
        let params = [0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0, 0, 0];
        assert_eq!(message_id_from_params(&params), 0x1234_5678);
        assert_eq!(message_id_to_params(0x1234_5678), [0x78, 0x56, 0x34, 0x12]);

        let wide = [0x1FF, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(message_id_from_params(&wide), 0xFF);
    }

    #[test]
    fn test_classify_commands() {
        let cmd = Command::parse(b"LOGGING_GETSIGNALLIST,1,2,0,0,0,0,0,0,0,0").unwrap();
        assert_eq!(
            ProtocolCommand::from_command(cmd),
            ProtocolCommand::GetSignalList { message_id: 0x0201 }
        );

        let cmd = Command::parse(b"LOGGING_ACTIVATE,40000,0,0,0,0,0,0,0,0,0").unwrap();
        assert_eq!(
            ProtocolCommand::from_command(cmd),
            ProtocolCommand::Activate { interval_s: 32767 }
        );

        // Negative intervals read as huge unsigned values and clamp to the maximum.
        let cmd = Command::parse(b"LOGGING_ACTIVATE,-1,0,0,0,0,0,0,0,0,0").unwrap();
        assert_eq!(
            ProtocolCommand::from_command(cmd),
            ProtocolCommand::Activate { interval_s: 32767 }
        );

        let cmd = Command::parse(b"LOGGING_ACTIVATE,0,0,0,0,0,0,0,0,0,0").unwrap();
        assert_eq!(
            ProtocolCommand::from_command(cmd),
            ProtocolCommand::Activate { interval_s: 0 }
        );

        let cmd = Command::parse(b"PUMP_ON,3,0,0,0,0,0,0,0,0,0").unwrap();
        assert!(matches!(
            ProtocolCommand::from_command(cmd),
            ProtocolCommand::Other(Command { ref name, .. }) if name == "PUMP_ON"
        ));
    }

    #[test]
    fn test_protocol_command_round_trip() {
        let commands = [
            ProtocolCommand::GetSignalList { message_id: 0xDEAD_BEEF },
            ProtocolCommand::GetData { message_id: 42 },
            ProtocolCommand::Activate { interval_s: 5 },
            ProtocolCommand::Deactivate,
        ];
        for command in commands {
            let line = command.to_command().encode();
            let mut framer = CommandFramer::new();
            assert_eq!(feed(&mut framer, &line), 1);
            let parsed = ProtocolCommand::from_command(framer.parse().unwrap());
            assert_eq!(parsed, command);
            assert_eq!(parsed.name(), command.name());
        }
    }
}
