use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vmproxy_protocol::Hyper;

use crate::config::EngineConfig;
use crate::demux;
use crate::error::{Result, VmError};
use crate::guest::GuestTransport;
use crate::registry::SessionRegistry;
use crate::relocate::relocate;
use crate::session::{ClientHandle, IoSession};
use crate::token::Token;

#[derive(Debug, Default)]
struct VmState {
    console: Option<PathBuf>,
    connected: bool,
    closed: bool,
}

/// One VM: its guest transport, its session registry and the background
/// workers reading from the guest.
pub struct Vm {
    id: String,
    guest: Arc<dyn GuestTransport>,
    registry: Arc<SessionRegistry>,
    state: Mutex<VmState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    lost: Arc<watch::Sender<bool>>,
    shutdown: watch::Sender<bool>,
}

impl Vm {
    pub fn new(id: impl Into<String>, guest: Arc<dyn GuestTransport>, config: EngineConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&guest), config));
        let (lost, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            id: id.into(),
            guest,
            registry,
            state: Mutex::new(VmState::default()),
            workers: Mutex::new(Vec::new()),
            lost: Arc::new(lost),
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stream the VM console at debug level once connected.
    pub async fn set_console(&self, path: impl Into<PathBuf>) {
        self.state.lock().await.console = Some(path.into());
    }

    /// Open the console (when configured) and the guest channels, wait for
    /// the agent and start the demultiplexer. The transport is closed again
    /// if the console cannot be opened or the agent never becomes ready.
    pub async fn connect(&self) -> Result<()> {
        let console = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(VmError::VmClosed(self.id.clone()));
            }
            if state.connected {
                return Err(VmError::AlreadyConnected(self.id.clone()));
            }
            state.connected = true;
            state.console.clone()
        };

        if let Some(path) = console {
            let stream = match UnixStream::connect(&path).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(vm = %self.id, console = %path.display(), error = %e, "failed to open vm console");
                    self.guest.close().await;
                    self.shutdown.send_replace(true);
                    return Err(e.into());
                }
            };
            let worker = tokio::spawn(stream_console(
                self.id.clone(),
                stream,
                self.shutdown.subscribe(),
            ));
            self.workers.lock().await.push(worker);
        }

        let ready = async {
            self.guest.open().await?;
            self.guest.wait_ready().await
        };
        if let Err(e) = ready.await {
            warn!(vm = %self.id, error = %e, "guest agent did not become ready");
            self.guest.close().await;
            self.shutdown.send_replace(true);
            return Err(e);
        }

        let worker = tokio::spawn(demux::run(
            self.id.clone(),
            Arc::clone(&self.guest),
            Arc::clone(&self.registry),
            Arc::clone(&self.lost),
        ));
        self.workers.lock().await.push(worker);
        info!(vm = %self.id, "vm connected");
        Ok(())
    }

    async fn ensure_open(&self) -> Result<()> {
        if self.state.lock().await.closed {
            return Err(VmError::VmClosed(self.id.clone()));
        }
        Ok(())
    }

    pub async fn allocate_token(&self) -> Result<Token> {
        self.ensure_open().await?;
        self.registry.allocate_token().await
    }

    pub async fn find_session(&self, token: &Token) -> Option<Arc<IoSession>> {
        self.registry.find_by_token(token).await
    }

    /// Bind a shim connection to the session owning `token`.
    pub async fn associate_shim(
        &self,
        token: &Token,
        client: ClientHandle,
    ) -> Result<Arc<IoSession>> {
        self.ensure_open().await?;
        let session = self.registry.attach_client(token, client).await?;
        debug!(vm = %self.id, %token, io_base = session.io_base(), "shim associated");
        Ok(session)
    }

    pub async fn free_token(&self, token: &Token) -> Result<()> {
        self.registry.free(token).await
    }

    /// Relocate `hyper`, forward it to the guest agent and mark the bound
    /// process as started. Returns the agent's reply payload.
    pub async fn send_message(&self, hyper: &mut Hyper) -> Result<Vec<u8>> {
        self.ensure_open().await?;
        let session = relocate(&self.registry, hyper).await?;

        let data = match &hyper.data {
            Some(value) => serde_json::to_vec(value)?,
            None => Vec::new(),
        };
        let reply = self.guest.send_control(&hyper.hyper_name, &data).await?;

        if let Some(session) = session {
            session.mark_process_started().await;
        }
        Ok(reply)
    }

    /// Receiver that flips to `true` once the guest I/O channel is gone.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost.subscribe()
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    pub async fn wait_lost(&self) {
        let mut rx = self.lost.subscribe();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    /// Tear the VM down: close the guest channels, free every session
    /// (closing their clients) and wait for the workers to exit. The wait is
    /// unbounded. Calling `close` again is a no-op.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
        }

        self.shutdown.send_replace(true);
        self.guest.close().await;
        self.registry.close_all().await;

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(vm = %self.id, error = %e, "vm worker failed");
            }
        }
        info!(vm = %self.id, "vm closed");
    }
}

async fn stream_console(vm_id: String, stream: UnixStream, mut shutdown: watch::Receiver<bool>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!(vm = %vm_id, "[console] {line}"),
                Ok(None) => break,
                Err(e) => {
                    debug!(vm = %vm_id, error = %e, "console read failed");
                    break;
                }
            },
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| *s).await;
}
