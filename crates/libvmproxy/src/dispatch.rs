//! Routes inbound frames to registered handlers and writes back their
//! responses.
//!
//! Command frames get exactly one response frame with the same opcode:
//! either a JSON object of results, or `{"msg": ...}` with the in-error flag
//! set. Stream frames get no response. Anything the dispatcher cannot route
//! ends [`Dispatcher::serve`] with an error and the caller drops the
//! connection.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::{Stream as FrameSource, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use vmproxy_protocol::{Command, Frame, FrameError, FrameType, Stream};

use crate::error::VmError;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no handler registered for command {0}")]
    UnhandledCommand(Command),

    #[error("no handler registered for {0} stream")]
    UnhandledStream(Stream),

    #[error("{stream} stream handler failed: {error}")]
    Stream { stream: Stream, error: VmError },

    #[error("unexpected {0} frame from client")]
    UnexpectedFrame(FrameType),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("connection closed before the response was written")]
    Closed,
}

/// What a command handler hands back: an error message or a result map.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HandlerResponse {
    error: Option<String>,
    results: Map<String, Value>,
}

impl HandlerResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_error(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
    }

    pub fn add_result(&mut self, key: impl Into<String>, value: Value) {
        self.results.insert(key.into(), value);
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn results(&self) -> &Map<String, Value> {
        &self.results
    }

    /// Response frame for `cmd`. An empty result map yields an empty payload.
    pub fn into_frame(self, cmd: Command) -> Result<Frame, FrameError> {
        if let Some(error) = self.error {
            return Ok(Frame::error_response(cmd, &error));
        }
        if self.results.is_empty() {
            return Ok(Frame::response(cmd, false, Vec::new()));
        }
        let payload = serde_json::to_vec(&Value::Object(self.results))?;
        Ok(Frame::response(cmd, false, payload))
    }
}

#[async_trait]
pub trait CommandHandler<C>: Send + Sync {
    async fn handle(&self, payload: &[u8], ctx: &C, response: &mut HandlerResponse);
}

#[async_trait]
pub trait StreamHandler<C>: Send + Sync {
    async fn handle(&self, stream: Stream, payload: &[u8], ctx: &C) -> Result<(), VmError>;
}

/// Handler table keyed by opcode. `C` is the per-connection context passed
/// to every handler.
pub struct Dispatcher<C> {
    commands: HashMap<Command, Box<dyn CommandHandler<C>>>,
    streams: HashMap<Stream, Box<dyn StreamHandler<C>>>,
}

impl<C: Send + Sync> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    pub fn handle_command(&mut self, cmd: Command, handler: impl CommandHandler<C> + 'static) {
        self.commands.insert(cmd, Box::new(handler));
    }

    pub fn handle_stream(&mut self, stream: Stream, handler: impl StreamHandler<C> + 'static) {
        self.streams.insert(stream, Box::new(handler));
    }

    /// Route one frame. Returns the response frame for commands and `None`
    /// for streams.
    pub async fn dispatch(&self, frame: &Frame, ctx: &C) -> Result<Option<Frame>, DispatchError> {
        match frame.frame_type() {
            FrameType::Command => {
                let cmd = frame
                    .command_opcode()
                    .ok_or(DispatchError::UnexpectedFrame(FrameType::Command))?;
                let handler = self
                    .commands
                    .get(&cmd)
                    .ok_or(DispatchError::UnhandledCommand(cmd))?;

                let mut response = HandlerResponse::new();
                handler.handle(&frame.payload, ctx, &mut response).await;
                if let Some(error) = response.error() {
                    debug!(command = %cmd, error, "command failed");
                }
                Ok(Some(response.into_frame(cmd)?))
            }
            FrameType::Stream => {
                let stream = frame
                    .stream_opcode()
                    .ok_or(DispatchError::UnexpectedFrame(FrameType::Stream))?;
                let handler = self
                    .streams
                    .get(&stream)
                    .ok_or(DispatchError::UnhandledStream(stream))?;
                handler
                    .handle(stream, &frame.payload, ctx)
                    .await
                    .map_err(|error| DispatchError::Stream { stream, error })?;
                Ok(None)
            }
            other => Err(DispatchError::UnexpectedFrame(other)),
        }
    }

    /// Dispatch every frame from `frames` until the source ends or a frame
    /// cannot be routed. Responses are queued on `out`.
    pub async fn serve<S>(
        &self,
        mut frames: S,
        out: &mpsc::Sender<Frame>,
        ctx: &C,
    ) -> Result<(), DispatchError>
    where
        S: FrameSource<Item = Result<Frame, FrameError>> + Unpin + Send,
    {
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if let Some(response) = self.dispatch(&frame, ctx).await? {
                out.send(response)
                    .await
                    .map_err(|_| DispatchError::Closed)?;
            }
        }
        Ok(())
    }
}

impl<C: Send + Sync> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}
