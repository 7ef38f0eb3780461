//! Boundary between the engine and the guest agent.
//!
//! The engine only ever sees named control commands with opaque payloads and
//! sequence-tagged I/O messages. How they are encoded on the wire is up to
//! the transport.

use async_trait::async_trait;

use crate::error::Result;

pub const NEW_CONTAINER: &str = "newcontainer";
pub const EXEC_CMD: &str = "execcmd";
pub const WINSIZE: &str = "winsize";
pub const KILL_CONTAINER: &str = "killcontainer";

/// One message on the guest I/O channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoMessage {
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl IoMessage {
    pub fn new(seq: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait GuestTransport: Send + Sync {
    /// Establish the control and I/O channels.
    async fn open(&self) -> Result<()>;

    /// Block until the guest agent reports it is ready.
    async fn wait_ready(&self) -> Result<()>;

    /// Send a named control command, returning the guest's reply payload.
    async fn send_control(&self, name: &str, data: &[u8]) -> Result<Vec<u8>>;

    /// Read the next I/O message. Errors are fatal to the VM.
    async fn read_io(&self) -> Result<IoMessage>;

    async fn send_io(&self, msg: IoMessage) -> Result<()>;

    /// Tear down both channels. A pending `read_io` must return an error.
    async fn close(&self);
}

pub mod memory {
    //! In-process transport pair. The [`MemoryGuest`] half plays the guest
    //! agent: it produces I/O messages, observes what the engine sends and
    //! can reject control commands.

    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::{Mutex, mpsc, watch};

    use super::{GuestTransport, IoMessage};
    use crate::error::{Result, VmError};

    /// Control command as recorded by the guest half.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ControlMessage {
        pub name: String,
        pub data: Vec<u8>,
    }

    impl ControlMessage {
        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.data).unwrap_or(serde_json::Value::Null)
        }
    }

    #[derive(Default)]
    struct Shared {
        controls: Vec<ControlMessage>,
        fail_next: Option<String>,
        open_error: Option<String>,
    }

    pub struct MemoryTransport {
        inbound: Mutex<mpsc::UnboundedReceiver<IoMessage>>,
        outbound: mpsc::UnboundedSender<IoMessage>,
        controls: mpsc::UnboundedSender<ControlMessage>,
        shared: Arc<std::sync::Mutex<Shared>>,
        closed: watch::Sender<bool>,
    }

    pub struct MemoryGuest {
        inbound: Option<mpsc::UnboundedSender<IoMessage>>,
        outbound: mpsc::UnboundedReceiver<IoMessage>,
        controls: mpsc::UnboundedReceiver<ControlMessage>,
        shared: Arc<std::sync::Mutex<Shared>>,
        closed: watch::Receiver<bool>,
    }

    impl MemoryTransport {
        pub fn pair() -> (MemoryTransport, MemoryGuest) {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
            let (closed_tx, closed_rx) = watch::channel(false);
            let shared = Arc::new(std::sync::Mutex::new(Shared::default()));
            (
                MemoryTransport {
                    inbound: Mutex::new(in_rx),
                    outbound: out_tx,
                    controls: ctl_tx,
                    shared: Arc::clone(&shared),
                    closed: closed_tx,
                },
                MemoryGuest {
                    inbound: Some(in_tx),
                    outbound: out_rx,
                    controls: ctl_rx,
                    shared,
                    closed: closed_rx,
                },
            )
        }

        fn ensure_open(&self) -> Result<()> {
            if *self.closed.borrow() {
                return Err(VmError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "transport closed",
                )));
            }
            Ok(())
        }

        fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
            self.shared.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait]
    impl GuestTransport for MemoryTransport {
        async fn open(&self) -> Result<()> {
            if let Some(reason) = self.shared().open_error.take() {
                return Err(VmError::GuestProtocol(reason));
            }
            self.ensure_open()
        }

        async fn wait_ready(&self) -> Result<()> {
            self.ensure_open()
        }

        async fn send_control(&self, name: &str, data: &[u8]) -> Result<Vec<u8>> {
            self.ensure_open()?;
            let failure = {
                let mut shared = self.shared();
                shared.controls.push(ControlMessage {
                    name: name.to_string(),
                    data: data.to_vec(),
                });
                shared.fail_next.take()
            };
            let _ = self.controls.send(ControlMessage {
                name: name.to_string(),
                data: data.to_vec(),
            });
            match failure {
                Some(message) => Err(VmError::Guest {
                    command: name.to_string(),
                    message,
                }),
                None => Ok(Vec::new()),
            }
        }

        async fn read_io(&self) -> Result<IoMessage> {
            let mut closed = self.closed.subscribe();
            let mut inbound = self.inbound.lock().await;
            if *closed.borrow_and_update() {
                return Err(VmError::Io(std::io::ErrorKind::NotConnected.into()));
            }
            tokio::select! {
                msg = inbound.recv() => msg.ok_or_else(|| {
                    VmError::Io(std::io::ErrorKind::UnexpectedEof.into())
                }),
                _ = closed.changed() => {
                    Err(VmError::Io(std::io::ErrorKind::NotConnected.into()))
                }
            }
        }

        async fn send_io(&self, msg: IoMessage) -> Result<()> {
            self.ensure_open()?;
            self.outbound
                .send(msg)
                .map_err(|_| VmError::Io(std::io::ErrorKind::BrokenPipe.into()))
        }

        async fn close(&self) {
            self.closed.send_replace(true);
        }
    }

    impl MemoryGuest {
        /// Queue a message for the engine's demultiplexer.
        pub fn send(&self, seq: u64, payload: impl Into<Vec<u8>>) {
            if let Some(tx) = &self.inbound {
                let _ = tx.send(IoMessage::new(seq, payload));
            }
        }

        /// Next I/O message the engine sent to the guest.
        pub async fn recv_io(&mut self) -> Option<IoMessage> {
            self.outbound.recv().await
        }

        /// Next control command the engine sent to the guest.
        pub async fn recv_control(&mut self) -> Option<ControlMessage> {
            self.controls.recv().await
        }

        /// Every control command received so far.
        pub fn controls(&self) -> Vec<ControlMessage> {
            self.shared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .controls
                .clone()
        }

        /// Make the next control command fail with `message`.
        pub fn fail_next_control(&self, message: &str) {
            self.shared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .fail_next = Some(message.to_string());
        }

        /// Make the next `open` fail.
        pub fn fail_open(&self, message: &str) {
            self.shared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .open_error = Some(message.to_string());
        }

        /// Simulate the guest dying: pending and future reads fail.
        pub fn disconnect(&mut self) {
            self.inbound = None;
        }

        pub fn is_closed(&self) -> bool {
            *self.closed.borrow()
        }
    }
}
