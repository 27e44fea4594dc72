//! Shared protocol constants, the command set and the control-message codec
//!
//! Control message layout (all integers little-endian):
//!
//! ```text
//! [1 byte : command tag]
//! [4 bytes: u32 argument length N]
//! [N bytes: argument, UTF-8]
//! [8 bytes: u64 data_size]
//! ```
//!
//! On the wire every control message is preceded by a u32 length prefix (see
//! `protocol_core`). Raw file bodies that follow DOWNLOAD responses and UPLOAD
//! requests are not framed at all.

use std::fmt;

use crate::error::{FtpError, Result};

// Maximum control message size (64MB) - prevents DoS via memory exhaustion
// Large enough for a LIST response over a very big directory
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// Size of the length prefix in front of every control message
pub const LEN_PREFIX_SIZE: usize = 4;

// Raw bodies move in bounded chunks of this size
pub const CHUNK_SIZE: usize = 8192;

// Prefix marking an error-carrying response argument
pub const ERROR_PREFIX: &str = "Error: ";

// tag (1) + argument length (4) + data_size (8)
const FIXED_FIELDS_SIZE: usize = 1 + 4 + 8;

// Centralized timeout constants and the per-connection deadline settings
pub mod timeouts {
    use serde::{Deserialize, Serialize};

    // How long a server session waits for the next command (ms)
    pub const IDLE_MS: u64 = 300_000;

    // Base timeout for a frame body or one raw chunk (ms)
    pub const IO_MS: u64 = 30_000;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Additional timeout per MB of frame payload (ms)
    pub const PER_MB_MS: u64 = 1;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Timeouts {
        pub idle_ms: u64,
        pub io_ms: u64,
        pub connect_ms: u64,
    }

    impl Default for Timeouts {
        fn default() -> Self {
            Self {
                idle_ms: IDLE_MS,
                io_ms: IO_MS,
                connect_ms: CONNECT_MS,
            }
        }
    }

    impl Timeouts {
        // io_ms base + 1ms per 1MB payload (ceil)
        pub fn frame_deadline_ms(&self, payload_len: usize) -> u64 {
            let mb = (payload_len as u64).div_ceil(1_048_576);
            self.io_ms + mb * PER_MB_MS
        }
    }
}

/// Operation kinds, in wire-tag order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    List = 0,
    Cd = 1,
    Download = 2,
    Upload = 3,
    Mkdir = 4,
    Rmdir = 5,
    Delete = 6,
    Pwd = 7,
    Quit = 8,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::List,
        Command::Cd,
        Command::Download,
        Command::Upload,
        Command::Mkdir,
        Command::Rmdir,
        Command::Delete,
        Command::Pwd,
        Command::Quit,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Command> {
        Command::ALL.get(tag as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::List => "LIST",
            Command::Cd => "CD",
            Command::Download => "DOWNLOAD",
            Command::Upload => "UPLOAD",
            Command::Mkdir => "MKDIR",
            Command::Rmdir => "RMDIR",
            Command::Delete => "DELETE",
            Command::Pwd => "PWD",
            Command::Quit => "QUIT",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Command {
    type Error = FtpError;

    fn try_from(tag: u8) -> Result<Self> {
        Command::from_tag(tag)
            .ok_or_else(|| FtpError::Framing(format!("unknown command tag {}", tag)))
    }
}

/// A control message: command, argument text and the length of any raw body
/// that follows it on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub argument: String,
    pub data_size: u64,
}

impl Message {
    pub fn new(command: Command, argument: impl Into<String>) -> Self {
        Self {
            command,
            argument: argument.into(),
            data_size: 0,
        }
    }

    pub fn with_data_size(mut self, data_size: u64) -> Self {
        self.data_size = data_size;
        self
    }

    /// Error-carrying response echoing the request's command.
    pub fn error(command: Command, message: impl fmt::Display) -> Self {
        Self::new(command, format!("{}{}", ERROR_PREFIX, message))
    }

    pub fn is_error(&self) -> bool {
        self.argument.starts_with(ERROR_PREFIX)
    }

    /// Number of bytes `serialize` will produce.
    pub fn encoded_len(&self) -> usize {
        FIXED_FIELDS_SIZE + self.argument.len()
    }

    /// Encode into the control message layout.
    ///
    /// Callers must keep the argument below `MAX_FRAME_SIZE`; `send_framed`
    /// enforces that before it calls this.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.command.tag());
        buf.extend_from_slice(&(self.argument.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.argument.as_bytes());
        buf.extend_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Message> {
        if data.len() < FIXED_FIELDS_SIZE {
            return Err(FtpError::Framing(format!(
                "message too short: {} bytes (min: {} bytes)",
                data.len(),
                FIXED_FIELDS_SIZE
            )));
        }
        let command = Command::try_from(data[0])?;

        let arg_len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
        let arg_end = 5usize
            .checked_add(arg_len)
            .filter(|end| end + 8 <= data.len())
            .ok_or_else(|| {
                FtpError::Framing(format!(
                    "argument length {} overruns {}-byte message",
                    arg_len,
                    data.len()
                ))
            })?;
        let argument = std::str::from_utf8(&data[5..arg_end])
            .map_err(|e| FtpError::Framing(format!("argument is not UTF-8: {}", e)))?
            .to_string();

        let size_end = arg_end + 8;
        if size_end != data.len() {
            return Err(FtpError::Framing(format!(
                "{} trailing bytes after message",
                data.len() - size_end
            )));
        }
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&data[arg_end..size_end]);

        Ok(Message {
            command,
            argument,
            data_size: u64::from_le_bytes(size_bytes),
        })
    }
}

/// A response as the caller sees it: either the expected payload or the
/// server's error text. Converts losslessly to and from the wire message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok(Message),
    Error { command: Command, message: String },
}

impl From<Message> for Response {
    fn from(msg: Message) -> Self {
        match msg.argument.strip_prefix(ERROR_PREFIX) {
            Some(text) => Response::Error {
                command: msg.command,
                message: text.to_string(),
            },
            None => Response::Ok(msg),
        }
    }
}

impl Response {
    pub fn command(&self) -> Command {
        match self {
            Response::Ok(msg) => msg.command,
            Response::Error { command, .. } => *command,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Response::Ok(msg) => msg,
            Response::Error { command, message } => Message::error(command, message),
        }
    }
}
