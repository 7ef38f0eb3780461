use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use futures_util::SinkExt;
use libvmproxy::{ClientHandle, Dispatcher, EngineConfig, IoSession, Token, Vm, VmError};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};
use vmproxy_protocol::{Frame, FrameCodec, IoResponse, paths};

use crate::config::ServerConfig;
use crate::handlers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenState {
    Allocated,
    Claimed,
}

struct TokenInfo {
    state: TokenState,
    vm: Arc<Vm>,
}

/// Daemon-wide state: registered VMs and the tokens handed out for them.
pub struct Proxy {
    socket_path: PathBuf,
    engine: EngineConfig,
    enable_vm_console: bool,
    vms: Mutex<HashMap<String, Arc<Vm>>>,
    tokens: Mutex<HashMap<Token, TokenInfo>>,
    next_client_id: AtomicU64,
}

impl Proxy {
    pub fn new(socket_path: impl Into<PathBuf>, engine: EngineConfig, enable_vm_console: bool) -> Self {
        Self {
            socket_path: socket_path.into(),
            engine,
            enable_vm_console,
            vms: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        self.engine
    }

    pub fn enable_vm_console(&self) -> bool {
        self.enable_vm_console
    }

    /// Insert `vm` unless its id is already registered.
    pub async fn add_vm(&self, vm: Arc<Vm>) -> bool {
        let mut vms = self.vms.lock().await;
        if vms.contains_key(vm.id()) {
            return false;
        }
        vms.insert(vm.id().to_string(), vm);
        true
    }

    pub async fn vm(&self, id: &str) -> Option<Arc<Vm>> {
        self.vms.lock().await.get(id).cloned()
    }

    pub async fn remove_vm(&self, id: &str) -> Option<Arc<Vm>> {
        self.vms.lock().await.remove(id)
    }

    /// Allocate `count` tokens on `vm` and record them as claimable. The
    /// response always carries the proxy url, even with no tokens.
    pub async fn allocate_tokens(&self, vm: &Arc<Vm>, count: usize) -> Result<IoResponse, VmError> {
        let mut tokens = Vec::with_capacity(count);
        for _ in 0..count {
            let token = vm.allocate_token().await?;
            self.tokens.lock().await.insert(
                token.clone(),
                TokenInfo {
                    state: TokenState::Allocated,
                    vm: Arc::clone(vm),
                },
            );
            tokens.push(token.to_string());
        }
        Ok(IoResponse {
            url: paths::socket_url(&self.socket_path),
            tokens,
        })
    }

    /// Move `token` to claimed and return the VM it belongs to.
    pub async fn claim_token(&self, token: &Token) -> Result<Arc<Vm>, String> {
        let mut tokens = self.tokens.lock().await;
        let info = tokens
            .get_mut(token)
            .ok_or_else(|| format!("unknown token: {token}"))?;
        if info.state == TokenState::Claimed {
            return Err(format!("token already claimed: {token}"));
        }
        info.state = TokenState::Claimed;
        Ok(Arc::clone(&info.vm))
    }

    /// Put a claimed token back so another shim can claim it.
    pub async fn unclaim_token(&self, token: &Token) {
        if let Some(info) = self.tokens.lock().await.get_mut(token) {
            info.state = TokenState::Allocated;
        }
    }

    /// Forget `token` and return the VM it belonged to.
    pub async fn release_token(&self, token: &Token) -> Option<Arc<Vm>> {
        self.tokens.lock().await.remove(token).map(|info| info.vm)
    }

    /// Close `vm` once its guest is gone and drop the tokens pointing at it.
    /// The VM stays registered until the runtime unregisters it.
    pub fn supervise(self: &Arc<Self>, vm: Arc<Vm>) {
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            vm.wait_lost().await;
            info!(vm = %vm.id(), "vm lost");
            vm.close().await;
            proxy.drop_tokens(&vm).await;
        });
    }

    pub async fn drop_tokens(&self, vm: &Arc<Vm>) {
        self.tokens
            .lock()
            .await
            .retain(|_, info| !Arc::ptr_eq(&info.vm, vm));
    }

    async fn close_all(&self) {
        let vms: Vec<Arc<Vm>> = self.vms.lock().await.drain().map(|(_, vm)| vm).collect();
        for vm in vms {
            vm.close().await;
        }
        self.tokens.lock().await.clear();
    }

    fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientKind {
    #[default]
    Runtime,
    Shim,
}

#[derive(Default)]
pub struct ClientState {
    pub kind: ClientKind,
    pub vm: Option<Arc<Vm>>,
    pub token: Option<Token>,
    pub session: Option<Arc<IoSession>>,
}

/// Per-connection context handed to every handler.
pub struct Client {
    pub proxy: Arc<Proxy>,
    pub handle: ClientHandle,
    pub state: Mutex<ClientState>,
}

impl Client {
    pub fn new(proxy: Arc<Proxy>, handle: ClientHandle) -> Self {
        Self {
            proxy,
            handle,
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Give the owned session back to the token table so a new shim can
    /// claim it. No-op once the shim disconnected cleanly.
    async fn release_session(&self) {
        let (token, session) = {
            let mut state = self.state.lock().await;
            (state.token.take(), state.session.take())
        };
        let (Some(token), Some(session)) = (token, session) else {
            return;
        };
        self.proxy.unclaim_token(&token).await;
        session.detach_client(self.id()).await;
        debug!(client = self.id(), %token, "shim gone, token back to allocated");
    }
}

pub async fn run(config: ServerConfig) -> Result<()> {
    let socket_path = config.socket_path.clone();
    let listener = bind(&socket_path)?;
    info!(socket = %socket_path.display(), pid = std::process::id(), "vmproxy started");

    let proxy = Arc::new(Proxy::new(
        socket_path.clone(),
        config.engine(),
        config.enable_vm_console,
    ));
    let dispatcher = Arc::new(handlers::dispatcher());

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let proxy = Arc::clone(&proxy);
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        handle_client(proxy, dispatcher, stream).await;
                    });
                }
                Err(e) => error!("accept error: {e}"),
            },
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
        }
    }

    info!("shutting down...");
    proxy.close_all().await;
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

/// Owner and group may connect.
const SOCKET_MODE: u32 = 0o660;

fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))
        .with_context(|| format!("failed to set mode on {}", socket_path.display()))?;
    Ok(listener)
}

/// Serve one runtime or shim connection until it hangs up, sends something
/// unroutable, or its VM closes it.
pub async fn handle_client(
    proxy: Arc<Proxy>,
    dispatcher: Arc<Dispatcher<Client>>,
    stream: UnixStream,
) {
    let (r, w) = stream.into_split();
    let reader = FramedRead::new(r, FrameCodec::new());
    let writer = FramedWrite::new(w, FrameCodec::new());

    let (tx, rx) = mpsc::channel(proxy.engine().client_queue_depth);
    let (handle, closed) = ClientHandle::new(proxy.next_client_id(), tx.clone());
    let client = Client::new(Arc::clone(&proxy), handle);
    info!(client = client.id(), "client connected");

    let writer_task = tokio::spawn(write_frames(client.id(), writer, rx, closed.clone()));

    let mut closed = closed;
    tokio::select! {
        res = dispatcher.serve(reader, &tx, &client) => {
            if let Err(e) = res {
                warn!(client = client.id(), error = %e, "error serving client");
            }
        }
        _ = wait_closed(&mut closed) => {
            debug!(client = client.id(), "connection closed by vm");
        }
    }

    client.release_session().await;
    client.handle.close();
    if let Err(e) = writer_task.await {
        warn!(client = client.id(), error = %e, "writer task failed");
    }
    info!(client = client.id(), "connection closed");
}

async fn write_frames(
    client_id: u64,
    mut writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = wait_closed(&mut closed) => {
                // flush what the engine queued before closing us
                while let Ok(frame) = rx.try_recv() {
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
                None
            }
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.send(frame).await {
            debug!(client = client_id, error = %e, "write error");
            break;
        }
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use libvmproxy::guest::memory::MemoryTransport;

    use super::*;

    fn proxy(dir: &Path) -> Proxy {
        Proxy::new(
            dir.join("vmproxy.sock"),
            EngineConfig::with_timeouts(Duration::from_millis(50), Duration::from_millis(50)),
            false,
        )
    }

    #[tokio::test]
    async fn zero_streams_still_report_the_proxy_url() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = proxy(dir.path());
        let (transport, _guest) = MemoryTransport::pair();
        let vm = Arc::new(Vm::new("vm1", Arc::new(transport), proxy.engine()));

        let io = proxy.allocate_tokens(&vm, 0).await.unwrap();
        assert_eq!(io.url, paths::socket_url(&dir.path().join("vmproxy.sock")));
        assert!(io.tokens.is_empty());
        let json = serde_json::to_value(&io).unwrap();
        assert!(json["url"].as_str().unwrap().starts_with("unix://"));

        let io = proxy.allocate_tokens(&vm, 2).await.unwrap();
        assert_eq!(io.tokens.len(), 2);
        vm.close().await;
    }

    #[tokio::test]
    async fn bound_socket_is_group_accessible_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("vmproxy.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let _listener = bind(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }
}
