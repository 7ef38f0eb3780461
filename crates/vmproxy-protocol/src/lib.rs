pub mod codec;
pub mod paths;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use codec::FrameCodec;

/// Version of the framed protocol spoken on the proxy socket.
pub const VERSION: u16 = 2;

/// Smallest valid header, in bytes. Headers are always a multiple of 4.
pub const MIN_HEADER_LENGTH: usize = 12;

/// Largest payload the codec accepts.
pub const MAX_PAYLOAD_LENGTH: usize = 16 * 1024 * 1024;

pub(crate) const FLAG_IN_ERROR: u8 = 1 << 4;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame: unsupported protocol version {0}")]
    BadVersion(u16),

    #[error("frame: header length {0} is too short")]
    BadHeaderLength(usize),

    #[error("frame: unknown frame type {0}")]
    BadType(u8),

    #[error("frame: unknown {frame_type} opcode {opcode}")]
    BadOpcode { frame_type: FrameType, opcode: u8 },

    #[error("frame: payload of {0} bytes exceeds the maximum")]
    PayloadTooLarge(usize),

    #[error("frame: truncated frame")]
    Truncated,

    #[error("frame: invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of frame, stored in the low nibble of header byte 6.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Command = 0,
    Response = 1,
    Stream = 2,
    Notification = 3,
}

impl FrameType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Command),
            1 => Some(Self::Response),
            2 => Some(Self::Stream),
            3 => Some(Self::Notification),
            _ => None,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "command",
            Self::Response => "response",
            Self::Stream => "stream",
            Self::Notification => "notification",
        };
        f.write_str(name)
    }
}

/// Commands a runtime or shim can issue. Also used as the opcode of the
/// matching response frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    RegisterVm = 0,
    UnregisterVm = 1,
    AttachVm = 2,
    Hyper = 3,
    ConnectShim = 4,
    DisconnectShim = 5,
    Signal = 6,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::RegisterVm,
        Command::UnregisterVm,
        Command::AttachVm,
        Command::Hyper,
        Command::ConnectShim,
        Command::DisconnectShim,
        Command::Signal,
    ];

    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RegisterVm => "RegisterVM",
            Self::UnregisterVm => "UnregisterVM",
            Self::AttachVm => "AttachVM",
            Self::Hyper => "Hyper",
            Self::ConnectShim => "ConnectShim",
            Self::DisconnectShim => "DisconnectShim",
            Self::Signal => "Signal",
        };
        f.write_str(name)
    }
}

/// Stream opcodes. Stdin and log flow from clients, stdout and stderr flow
/// to shims.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    Log = 3,
}

impl Stream {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            3 => Some(Self::Log),
            _ => None,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Log => "log",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    /// Payload is a single byte holding the exit status.
    ProcessExited = 0,
}

impl Notification {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::ProcessExited),
            _ => None,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessExited => f.write_str("ProcessExited"),
        }
    }
}

/// Decoded frame header. `header_length` is in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub header_length: usize,
    pub frame_type: FrameType,
    pub opcode: u8,
    pub in_error: bool,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, opcode: u8) -> Self {
        Self {
            version: VERSION,
            header_length: MIN_HEADER_LENGTH,
            frame_type,
            opcode,
            in_error: false,
        }
    }
}

/// A single protocol frame: header plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            header: FrameHeader::new(frame_type, opcode),
            payload,
        }
    }

    /// Build a frame whose payload is `payload` serialised as JSON. `None`
    /// yields an empty payload.
    pub fn json<T: Serialize>(
        frame_type: FrameType,
        opcode: u8,
        payload: Option<&T>,
    ) -> Result<Self, FrameError> {
        let bytes = match payload {
            Some(value) => serde_json::to_vec(value)?,
            None => Vec::new(),
        };
        Ok(Self::new(frame_type, opcode, bytes))
    }

    pub fn command(cmd: Command, payload: Vec<u8>) -> Self {
        Self::new(FrameType::Command, cmd as u8, payload)
    }

    pub fn response(cmd: Command, in_error: bool, payload: Vec<u8>) -> Self {
        let mut frame = Self::new(FrameType::Response, cmd as u8, payload);
        frame.header.in_error = in_error;
        frame
    }

    pub fn stream(stream: Stream, payload: Vec<u8>) -> Self {
        Self::new(FrameType::Stream, stream as u8, payload)
    }

    pub fn notification(notification: Notification, payload: Vec<u8>) -> Self {
        Self::new(FrameType::Notification, notification as u8, payload)
    }

    /// Error response carrying `{"msg": message}`.
    pub fn error_response(cmd: Command, message: &str) -> Self {
        let payload = serde_json::to_vec(&ErrorResponse {
            message: message.to_string(),
        })
        .unwrap_or_default();
        Self::response(cmd, true, payload)
    }

    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    pub fn command_opcode(&self) -> Option<Command> {
        match self.header.frame_type {
            FrameType::Command | FrameType::Response => Command::from_u8(self.header.opcode),
            _ => None,
        }
    }

    pub fn stream_opcode(&self) -> Option<Stream> {
        match self.header.frame_type {
            FrameType::Stream => Stream::from_u8(self.header.opcode),
            _ => None,
        }
    }

    pub fn notification_opcode(&self) -> Option<Notification> {
        match self.header.frame_type {
            FrameType::Notification => Notification::from_u8(self.header.opcode),
            _ => None,
        }
    }

    /// Decode the payload as JSON. An empty payload decodes as `{}`.
    pub fn decode_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, FrameError> {
        if self.payload.is_empty() {
            return Ok(serde_json::from_slice(b"{}")?);
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Payload of a response frame with the in-error flag set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    #[serde(rename = "msg")]
    pub message: String,
}

/// Tokens handed out for new I/O sessions, with the URL shims connect to.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IoResponse {
    pub url: String,
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegisterVm {
    #[serde(rename = "containerId")]
    pub container_id: String,
    pub ctl_serial: String,
    pub io_serial: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<String>,
    #[serde(default, rename = "numIOStreams")]
    pub num_io_streams: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RegisterVmResponse {
    #[serde(default)]
    pub io: IoResponse,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AttachVm {
    #[serde(rename = "containerId")]
    pub container_id: String,
    #[serde(default, rename = "numIOStreams")]
    pub num_io_streams: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AttachVmResponse {
    #[serde(default)]
    pub io: IoResponse,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UnregisterVm {
    #[serde(rename = "containerId")]
    pub container_id: String,
}

/// A guest agent command forwarded verbatim, apart from sequence number
/// relocation for the commands that start processes.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Hyper {
    #[serde(rename = "hyperName")]
    pub hyper_name: String,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConnectShim {
    pub token: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DisconnectShim {}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Signal {
    #[serde(rename = "signalNumber")]
    pub signal_number: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub columns: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rows: u32,
}

/// Log line forwarded by a shim or runtime over the log stream.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LogEntry {
    pub source: String,
    #[serde(
        default,
        rename = "containerId",
        skip_serializing_if = "Option::is_none"
    )]
    pub container_id: Option<String>,
    pub level: String,
    #[serde(rename = "msg")]
    pub message: String,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}
