//! Guest transport speaking the hyperstart agent protocol over two Unix
//! stream sockets, one for control messages and one for process I/O.
//!
//! Control message: `code: u32 | length: u32 | payload`.
//! I/O message: `seq: u64 | length: u32 | payload`.
//! Both lengths are big endian, include the header and are capped at
//! [`MAX_MESSAGE_SIZE`] in either direction.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio_util::codec::{Decoder, Encoder, Framed, FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::error::{Result, VmError};
use crate::guest::{GuestTransport, IoMessage};

pub const CTL_HEADER_SIZE: usize = 8;
pub const TTY_HEADER_SIZE: usize = 12;
/// Size of the guest agent's receive buffer; larger messages are refused.
pub const MAX_MESSAGE_SIZE: usize = 10240;

pub const READY: u32 = 8;
pub const ACK: u32 = 9;
pub const ERROR: u32 = 10;

const COMMANDS: &[(&str, u32)] = &[
    ("version", 0),
    ("startpod", 1),
    ("destroypod", 4),
    ("execcmd", 6),
    ("ready", READY),
    ("ack", ACK),
    ("error", ERROR),
    ("winsize", 11),
    ("ping", 12),
    ("finishpod", 13),
    ("next", 14),
    ("writefile", 15),
    ("readfile", 16),
    ("newcontainer", 17),
    ("killcontainer", 18),
    ("onlinecpumem", 19),
    ("setupinterface", 20),
    ("setuproute", 21),
    ("removecontainer", 22),
];

pub fn command_code(name: &str) -> Option<u32> {
    COMMANDS
        .iter()
        .find(|(cmd, _)| *cmd == name)
        .map(|(_, code)| *code)
}

/// One message on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlMessage {
    pub code: u32,
    pub payload: Vec<u8>,
}

impl CtlMessage {
    pub fn new(code: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }
}

/// Checks a declared message length against the header size and the
/// agent's buffer.
fn check_length(kind: &str, length: usize, header: usize) -> Result<()> {
    if length < header {
        return Err(VmError::GuestProtocol(format!(
            "{kind} message length {length} shorter than its header"
        )));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(VmError::GuestProtocol(format!(
            "{kind} message too long: {length} bytes"
        )));
    }
    Ok(())
}

fn truncated(kind: &str) -> VmError {
    VmError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("truncated {kind} message"),
    ))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CtlCodec;

impl Decoder for CtlCodec {
    type Item = CtlMessage;
    type Error = VmError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<CtlMessage>> {
        if src.len() < CTL_HEADER_SIZE {
            return Ok(None);
        }
        let code = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        check_length("control", length, CTL_HEADER_SIZE)?;

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        src.advance(CTL_HEADER_SIZE);
        let payload = src.split_to(length - CTL_HEADER_SIZE).to_vec();
        Ok(Some(CtlMessage { code, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<CtlMessage>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(truncated("control")),
        }
    }
}

impl Encoder<CtlMessage> for CtlCodec {
    type Error = VmError;

    fn encode(&mut self, msg: CtlMessage, dst: &mut BytesMut) -> Result<()> {
        let length = CTL_HEADER_SIZE + msg.payload.len();
        check_length("control", length, CTL_HEADER_SIZE)?;
        dst.reserve(length);
        dst.put_u32(msg.code);
        dst.put_u32(length as u32);
        dst.put_slice(&msg.payload);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IoCodec;

impl Decoder for IoCodec {
    type Item = IoMessage;
    type Error = VmError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<IoMessage>> {
        if src.len() < TTY_HEADER_SIZE {
            return Ok(None);
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&src[..8]);
        let length = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        check_length("io", length, TTY_HEADER_SIZE)?;

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        src.advance(TTY_HEADER_SIZE);
        let payload = src.split_to(length - TTY_HEADER_SIZE).to_vec();
        Ok(Some(IoMessage::new(u64::from_be_bytes(seq), payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<IoMessage>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(truncated("io")),
        }
    }
}

impl Encoder<IoMessage> for IoCodec {
    type Error = VmError;

    fn encode(&mut self, msg: IoMessage, dst: &mut BytesMut) -> Result<()> {
        let length = TTY_HEADER_SIZE + msg.payload.len();
        check_length("io", length, TTY_HEADER_SIZE)?;
        dst.reserve(length);
        dst.put_u64(msg.seq);
        dst.put_u32(length as u32);
        dst.put_slice(&msg.payload);
        Ok(())
    }
}

fn closed_error() -> VmError {
    VmError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "hyperstart channel closed",
    ))
}

/// End of stream on a channel the agent should keep open.
fn hung_up<T>(next: Option<Result<T>>) -> Result<T> {
    next.unwrap_or_else(|| {
        Err(VmError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "hyperstart agent hung up",
        )))
    })
}

pub struct HyperstartTransport {
    ctl_path: PathBuf,
    io_path: PathBuf,
    /// Held for a whole request/reply exchange.
    ctl: Mutex<Option<Framed<UnixStream, CtlCodec>>>,
    io_read: Mutex<Option<FramedRead<OwnedReadHalf, IoCodec>>>,
    io_write: Mutex<Option<FramedWrite<OwnedWriteHalf, IoCodec>>>,
    closed: watch::Sender<bool>,
}

impl HyperstartTransport {
    pub fn new(ctl_path: impl AsRef<Path>, io_path: impl AsRef<Path>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            ctl_path: ctl_path.as_ref().to_path_buf(),
            io_path: io_path.as_ref().to_path_buf(),
            ctl: Mutex::new(None),
            io_read: Mutex::new(None),
            io_write: Mutex::new(None),
            closed,
        }
    }

    async fn next_ctl(&self, ctl: &mut Framed<UnixStream, CtlCodec>) -> Result<CtlMessage> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_error());
        }
        tokio::select! {
            next = ctl.next() => hung_up(next),
            _ = closed.changed() => Err(closed_error()),
        }
    }
}

#[async_trait]
impl GuestTransport for HyperstartTransport {
    async fn open(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(closed_error());
        }
        let ctl = UnixStream::connect(&self.ctl_path).await?;
        let io = UnixStream::connect(&self.io_path).await?;
        let (io_read, io_write) = io.into_split();

        *self.ctl.lock().await = Some(Framed::new(ctl, CtlCodec));
        *self.io_read.lock().await = Some(FramedRead::new(io_read, IoCodec));
        *self.io_write.lock().await = Some(FramedWrite::new(io_write, IoCodec));
        debug!(ctl = %self.ctl_path.display(), io = %self.io_path.display(), "hyperstart channels open");
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut guard = self.ctl.lock().await;
        let ctl = guard.as_mut().ok_or_else(closed_error)?;
        let msg = self.next_ctl(ctl).await?;
        if msg.code != READY {
            return Err(VmError::GuestProtocol(format!(
                "expected READY ({READY}), got code {}",
                msg.code
            )));
        }
        Ok(())
    }

    async fn send_control(&self, name: &str, data: &[u8]) -> Result<Vec<u8>> {
        let code = command_code(name)
            .ok_or_else(|| VmError::GuestProtocol(format!("unknown command {name}")))?;

        let mut guard = self.ctl.lock().await;
        let ctl = guard.as_mut().ok_or_else(closed_error)?;
        ctl.send(CtlMessage::new(code, data)).await?;
        trace!(command = name, code, len = data.len(), "sent control message");

        loop {
            let reply = self.next_ctl(ctl).await?;
            match reply.code {
                ACK => return Ok(reply.payload),
                ERROR => {
                    return Err(VmError::Guest {
                        command: name.to_string(),
                        message: String::from_utf8_lossy(&reply.payload).into_owned(),
                    });
                }
                other => debug!(code = other, "skipping unsolicited control message"),
            }
        }
    }

    async fn read_io(&self) -> Result<IoMessage> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.io_read.lock().await;
        if *closed.borrow_and_update() {
            return Err(closed_error());
        }
        let reader = guard.as_mut().ok_or_else(closed_error)?;
        tokio::select! {
            next = reader.next() => hung_up(next),
            _ = closed.changed() => Err(closed_error()),
        }
    }

    async fn send_io(&self, msg: IoMessage) -> Result<()> {
        let mut guard = self.io_write.lock().await;
        let writer = guard.as_mut().ok_or_else(closed_error)?;
        writer.send(msg).await
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Some(mut writer) = self.io_write.lock().await.take() {
            let _ = writer.close().await;
        }
        self.ctl.lock().await.take();
    }
}
