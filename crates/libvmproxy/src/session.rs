use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use vmproxy_protocol::{Frame, Notification};

use crate::config::EngineConfig;
use crate::error::{Result, VmError};
use crate::gate::Gate;
use crate::guest::{GuestTransport, IoMessage, KILL_CONTAINER, WINSIZE};
use crate::token::Token;

/// Sequence number of the null session's primary stream.
pub const NULL_SESSION_STDOUT: u64 = 1;
/// Sequence number of the null session's secondary stream.
pub const NULL_SESSION_STDERR: u64 = 2;
/// First ioBase handed to a real session.
pub const FIRST_IO_BASE: u64 = 3;
/// Every session owns `ioBase` and `ioBase + 1`.
pub const STREAMS_PER_SESSION: u64 = 2;

/// The engine's view of a connected client: an outbound frame queue plus a
/// close signal observed by whoever owns the socket.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    tx: mpsc::Sender<Frame>,
    closed: Arc<watch::Sender<bool>>,
}

impl ClientHandle {
    /// Returns the handle and the receiver that flips to `true` on close.
    pub fn new(id: u64, tx: mpsc::Sender<Frame>) -> (Self, watch::Receiver<bool>) {
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            Self {
                id,
                tx,
                closed: Arc::new(closed_tx),
            },
            closed_rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(VmError::ClientClosed);
        }
        self.tx.send(frame).await.map_err(|_| VmError::ClientClosed)
    }

    /// Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy)]
enum GateKind {
    ShimConnected,
    ProcessStarted,
}

struct SessionState {
    terminated: bool,
    client: Option<ClientHandle>,
    container_id: Option<String>,
    shim_connected: Gate,
    /// Bumped every time the shim gate is replaced.
    shim_generation: u64,
    process_started: Gate,
}

impl SessionState {
    fn new(shim_connected: Gate) -> Self {
        Self {
            terminated: false,
            client: None,
            container_id: None,
            shim_connected,
            shim_generation: 0,
            process_started: Gate::new(),
        }
    }

    fn reopen_shim_gate(&mut self) {
        self.client = None;
        self.shim_connected = Gate::new();
        self.shim_generation += 1;
    }

    fn gate(&self, kind: GateKind) -> &Gate {
        match kind {
            GateKind::ShimConnected => &self.shim_connected,
            GateKind::ProcessStarted => &self.process_started,
        }
    }
}

/// Stream state for one guest process.
pub struct IoSession {
    token: Option<Token>,
    io_base: u64,
    null: bool,
    guest: Arc<dyn GuestTransport>,
    config: EngineConfig,
    state: Mutex<SessionState>,
}

impl IoSession {
    pub(crate) fn new(
        token: Token,
        io_base: u64,
        guest: Arc<dyn GuestTransport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            token: Some(token),
            io_base,
            null: false,
            guest,
            config,
            state: Mutex::new(SessionState::new(Gate::new())),
        }
    }

    /// The sink for processes nobody listens to. Its shim gate starts fired
    /// so commands bound to it never wait.
    pub(crate) fn null(guest: Arc<dyn GuestTransport>, config: EngineConfig) -> Self {
        Self {
            token: None,
            io_base: NULL_SESSION_STDOUT,
            null: true,
            guest,
            config,
            state: Mutex::new(SessionState::new(Gate::fired())),
        }
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn io_base(&self) -> u64 {
        self.io_base
    }

    pub fn stderr_seq(&self) -> u64 {
        self.io_base + 1
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub async fn is_terminated(&self) -> bool {
        self.state.lock().await.terminated
    }

    pub async fn mark_terminated(&self) {
        self.state.lock().await.terminated = true;
    }

    pub async fn container_id(&self) -> Option<String> {
        self.state.lock().await.container_id.clone()
    }

    pub async fn set_container_id(&self, id: impl Into<String>) {
        self.state.lock().await.container_id = Some(id.into());
    }

    pub async fn client(&self) -> Option<ClientHandle> {
        self.state.lock().await.client.clone()
    }

    pub async fn is_shim_connected(&self) -> bool {
        self.state.lock().await.shim_connected.is_fired()
    }

    pub async fn is_process_started(&self) -> bool {
        self.state.lock().await.process_started.is_fired()
    }

    /// Bind a client and fire the shim gate. A second attach without an
    /// intervening reset is refused.
    pub(crate) async fn attach(&self, client: ClientHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.shim_connected.is_fired() {
            return Err(VmError::ShimAlreadyConnected(self.token_label()));
        }
        debug!(token = %self.token_label(), client = client.id(), "shim connected");
        state.client = Some(client);
        state.shim_connected.fire();
        Ok(())
    }

    /// Block until a shim is attached or the shim timeout elapses. The
    /// session is left untouched on timeout.
    pub async fn wait_for_shim(&self) -> Result<()> {
        let timeout = self.config.shim_wait_timeout;
        if self.wait_gate(GateKind::ShimConnected, timeout).await {
            Ok(())
        } else {
            Err(VmError::ShimTimeout(timeout))
        }
    }

    /// Block until the process has been started in the guest. With
    /// `should_reset`, a timeout reopens the shim gate so the next shim has
    /// to attach again. The gate is left alone if the process started or a
    /// shim re-attached while the timeout was being handled.
    pub async fn wait_for_process(&self, should_reset: bool) -> Result<()> {
        let timeout = self.config.process_wait_timeout;
        let generation = self.state.lock().await.shim_generation;
        if self.wait_gate(GateKind::ProcessStarted, timeout).await {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.process_started.is_fired() {
            return Ok(());
        }
        if should_reset && !self.null {
            if state.shim_generation == generation {
                state.reopen_shim_gate();
                debug!(token = %self.token_label(), "process wait timed out, shim gate reopened");
            } else {
                debug!(token = %self.token_label(), "process wait timed out, shim already replaced");
            }
        }
        Err(VmError::ProcessTimeout(timeout))
    }

    async fn wait_gate(&self, kind: GateKind, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut rx = self.state.lock().await.gate(kind).subscribe();
            let fired = async move { rx.wait_for(|fired| *fired).await.is_ok() };
            match tokio::time::timeout_at(deadline, fired).await {
                Ok(true) => return true,
                // gate was replaced while we waited, follow the new one
                Ok(false) => continue,
                Err(_) => return false,
            }
        }
    }

    /// Fire the process-started gate. Repeats are logged and ignored.
    pub async fn mark_process_started(&self) {
        if self.null {
            return;
        }
        let state = self.state.lock().await;
        if !state.process_started.fire() {
            warn!(token = %self.token_label(), "process already marked as started");
        }
    }

    pub async fn forward_stdin(&self, payload: Vec<u8>) -> Result<()> {
        self.wait_for_process(true).await?;
        self.guest
            .send_io(IoMessage::new(self.io_base, payload))
            .await
    }

    pub async fn send_terminal_resize(&self, columns: u32, rows: u32) -> Result<()> {
        let payload = json!({
            "seq": self.io_base,
            "row": rows,
            "column": columns,
        });
        let data = serde_json::to_vec(&payload)?;
        self.guest.send_control(WINSIZE, &data).await?;
        Ok(())
    }

    /// Only sessions bound to a container can be signalled; the guest has no
    /// way to address an exec'd process. An empty id counts as unbound.
    pub async fn send_signal(&self, signal: i32) -> Result<()> {
        let container = self
            .container_id()
            .await
            .filter(|id| !id.is_empty())
            .ok_or(VmError::NoContainer)?;
        let payload = json!({
            "container": container,
            "signal": signal,
            "allProcesses": false,
        });
        let data = serde_json::to_vec(&payload)?;
        self.guest.send_control(KILL_CONTAINER, &data).await?;
        Ok(())
    }

    /// Tell the attached shim its process exited with status 0.
    pub async fn terminate_shim(&self) -> Result<()> {
        let client = self.client().await.ok_or(VmError::NoClient)?;
        client
            .send(Frame::notification(Notification::ProcessExited, vec![0]))
            .await
    }

    /// Drop the client and reopen the shim gate so a new shim can attach.
    pub async fn reset_shim(&self) {
        if self.null {
            return;
        }
        self.state.lock().await.reopen_shim_gate();
    }

    /// Like [`reset_shim`](Self::reset_shim) but only if `client_id` is the
    /// client currently attached. Returns whether anything changed.
    pub async fn detach_client(&self, client_id: u64) -> bool {
        if self.null {
            return false;
        }
        let mut state = self.state.lock().await;
        match &state.client {
            Some(client) if client.id() == client_id => {
                state.reopen_shim_gate();
                true
            }
            _ => false,
        }
    }

    /// Close the attached client, if any, and mark the session terminated.
    pub(crate) async fn close(&self) {
        let client = {
            let mut state = self.state.lock().await;
            state.terminated = true;
            state.client.take()
        };
        if let Some(client) = client {
            client.close();
        }
    }

    fn token_label(&self) -> String {
        match &self.token {
            Some(token) => token.to_string(),
            None => "<null>".to_string(),
        }
    }
}

impl std::fmt::Debug for IoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSession")
            .field("token", &self.token)
            .field("io_base", &self.io_base)
            .field("null", &self.null)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::memory::MemoryTransport;
    use vmproxy_protocol::FrameType;

    fn fast_config() -> EngineConfig {
        EngineConfig::with_timeouts(Duration::from_millis(50), Duration::from_millis(50))
    }

    fn new_session() -> (IoSession, crate::guest::memory::MemoryGuest) {
        let (transport, guest) = MemoryTransport::pair();
        let session = IoSession::new(
            Token::from("tok"),
            FIRST_IO_BASE,
            Arc::new(transport),
            fast_config(),
        );
        (session, guest)
    }

    fn client(id: u64) -> (ClientHandle, mpsc::Receiver<Frame>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(8);
        let (handle, closed) = ClientHandle::new(id, tx);
        (handle, rx, closed)
    }

    #[tokio::test]
    async fn null_session_never_waits_for_shim() {
        let (transport, _guest) = MemoryTransport::pair();
        let session = IoSession::null(Arc::new(transport), fast_config());
        assert!(session.is_null());
        assert_eq!(session.io_base(), NULL_SESSION_STDOUT);
        assert_eq!(session.stderr_seq(), NULL_SESSION_STDERR);
        session.wait_for_shim().await.unwrap();
    }

    #[tokio::test]
    async fn shim_wait_times_out_without_reset() {
        let (session, _guest) = new_session();
        let err = session.wait_for_shim().await.unwrap_err();
        assert!(err.is_timeout());

        let (handle, _rx, _closed) = client(1);
        session.attach(handle).await.unwrap();
        session.wait_for_shim().await.unwrap();
    }

    #[tokio::test]
    async fn shim_wait_unblocks_on_attach() {
        let (transport, _guest) = MemoryTransport::pair();
        let session = Arc::new(IoSession::new(
            Token::from("late"),
            FIRST_IO_BASE,
            Arc::new(transport),
            EngineConfig::with_timeouts(Duration::from_secs(5), Duration::from_secs(5)),
        ));
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.wait_for_shim().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (handle, _rx, _closed) = client(7);
        session.attach(handle).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_attach_is_refused() {
        let (session, _guest) = new_session();
        let (first, _rx1, _c1) = client(1);
        let (second, _rx2, _c2) = client(2);
        session.attach(first).await.unwrap();
        let err = session.attach(second).await.unwrap_err();
        assert!(matches!(err, VmError::ShimAlreadyConnected(_)));
        assert_eq!(session.client().await.unwrap().id(), 1);
    }

    #[tokio::test]
    async fn process_timeout_with_reset_reopens_shim_gate() {
        let (session, _guest) = new_session();
        let (handle, _rx, _closed) = client(1);
        session.attach(handle).await.unwrap();

        let err = session.wait_for_process(false).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(session.is_shim_connected().await);

        let err = session.wait_for_process(true).await.unwrap_err();
        assert!(matches!(err, VmError::ProcessTimeout(_)));
        assert!(!session.is_shim_connected().await);

        let (again, _rx2, _c2) = client(2);
        session.attach(again).await.unwrap();
    }

    #[tokio::test]
    async fn process_start_racing_the_timeout_keeps_the_shim() {
        let (session, _guest) = new_session();
        let session = Arc::new(session);
        let (handle, _rx, _closed) = client(1);
        session.attach(handle).await.unwrap();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.wait_for_process(true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // hold the state past the deadline, then start the process before
        // the timed out waiter gets the lock back
        let state = session.state.lock().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        state.process_started.fire();
        drop(state);

        waiter.await.unwrap().unwrap();
        assert!(session.is_shim_connected().await);
        assert_eq!(session.client().await.unwrap().id(), 1);
    }

    #[tokio::test]
    async fn process_timeout_spares_a_reattached_shim() {
        let (session, _guest) = new_session();
        let session = Arc::new(session);
        let (first, _rx1, _c1) = client(1);
        session.attach(first).await.unwrap();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.wait_for_process(true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.detach_client(1).await);
        let (second, _rx2, _c2) = client(2);
        session.attach(second).await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, VmError::ProcessTimeout(_)));
        assert!(session.is_shim_connected().await);
        assert_eq!(session.client().await.unwrap().id(), 2);
    }

    #[tokio::test]
    async fn stdin_waits_for_process_start() {
        let (transport, mut guest) = MemoryTransport::pair();
        let session = Arc::new(IoSession::new(
            Token::from("stdin"),
            9,
            Arc::new(transport),
            EngineConfig::with_timeouts(Duration::from_secs(5), Duration::from_secs(5)),
        ));
        let writer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.forward_stdin(b"echo\n".to_vec()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.mark_process_started().await;
        writer.await.unwrap().unwrap();

        let msg = guest.recv_io().await.unwrap();
        assert_eq!(msg, IoMessage::new(9, b"echo\n".to_vec()));
    }

    #[tokio::test]
    async fn stdin_times_out_when_process_never_starts() {
        let (session, _guest) = new_session();
        let err = session.forward_stdin(b"x".to_vec()).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn resize_sends_winsize() {
        let (session, mut guest) = new_session();
        session.send_terminal_resize(120, 40).await.unwrap();
        let ctl = guest.recv_control().await.unwrap();
        assert_eq!(ctl.name, WINSIZE);
        assert_eq!(
            ctl.json(),
            json!({"seq": FIRST_IO_BASE, "row": 40, "column": 120})
        );
    }

    #[tokio::test]
    async fn signal_needs_container() {
        let (session, mut guest) = new_session();
        let err = session.send_signal(15).await.unwrap_err();
        assert!(matches!(err, VmError::NoContainer));

        session.set_container_id("c1").await;
        session.send_signal(15).await.unwrap();
        let ctl = guest.recv_control().await.unwrap();
        assert_eq!(ctl.name, KILL_CONTAINER);
        assert_eq!(
            ctl.json(),
            json!({"container": "c1", "signal": 15, "allProcesses": false})
        );
    }

    #[tokio::test]
    async fn empty_container_id_cannot_be_signalled() {
        let (session, guest) = new_session();
        session.set_container_id("").await;
        let err = session.send_signal(9).await.unwrap_err();
        assert!(matches!(err, VmError::NoContainer));
        assert!(guest.controls().is_empty());
    }

    #[tokio::test]
    async fn terminate_shim_sends_zero_exit() {
        let (session, _guest) = new_session();
        assert!(matches!(
            session.terminate_shim().await,
            Err(VmError::NoClient)
        ));

        let (handle, mut rx, _closed) = client(1);
        session.attach(handle).await.unwrap();
        session.terminate_shim().await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type(), FrameType::Notification);
        assert_eq!(frame.payload, vec![0]);
    }

    #[tokio::test]
    async fn detach_only_matches_current_client() {
        let (session, _guest) = new_session();
        let (handle, _rx, _closed) = client(4);
        session.attach(handle).await.unwrap();

        assert!(!session.detach_client(5).await);
        assert!(session.is_shim_connected().await);
        assert!(session.detach_client(4).await);
        assert!(!session.is_shim_connected().await);
        assert!(session.client().await.is_none());
    }

    #[tokio::test]
    async fn close_signals_client() {
        let (session, _guest) = new_session();
        let (handle, _rx, closed) = client(1);
        session.attach(handle).await.unwrap();
        session.close().await;
        assert!(*closed.borrow());
        assert!(session.is_terminated().await);
        assert!(session.client().await.is_none());
    }

    #[tokio::test]
    async fn repeated_process_start_is_ignored() {
        let (session, _guest) = new_session();
        session.mark_process_started().await;
        session.mark_process_started().await;
        assert!(session.is_process_started().await);
        session.wait_for_process(true).await.unwrap();
    }
}
