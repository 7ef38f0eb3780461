//! Command and stream handlers for the runtime/shim socket.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use libvmproxy::{
    CommandHandler, Dispatcher, HandlerResponse, HyperstartTransport, StreamHandler, Token, Vm,
    VmError,
};
use nix::sys::signal::Signal as UnixSignal;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};
use vmproxy_protocol::{
    AttachVm, Command, ConnectShim, Hyper, LogEntry, RegisterVm, Signal, Stream, UnregisterVm,
};

use crate::server::{Client, ClientKind};

/// Dispatcher with every command and stream the daemon serves.
pub fn dispatcher() -> Dispatcher<Client> {
    let mut d = Dispatcher::new();
    d.handle_command(Command::RegisterVm, RegisterVmCmd);
    d.handle_command(Command::AttachVm, AttachVmCmd);
    d.handle_command(Command::UnregisterVm, UnregisterVmCmd);
    d.handle_command(Command::Hyper, HyperCmd);
    d.handle_command(Command::ConnectShim, ConnectShimCmd);
    d.handle_command(Command::DisconnectShim, DisconnectShimCmd);
    d.handle_command(Command::Signal, SignalCmd);
    d.handle_stream(Stream::Stdin, StdinStream);
    d.handle_stream(Stream::Log, LogStream);
    d
}

macro_rules! command_handler {
    ($name:ident, $func:ident) => {
        struct $name;

        #[async_trait]
        impl CommandHandler<Client> for $name {
            async fn handle(&self, payload: &[u8], client: &Client, response: &mut HandlerResponse) {
                if let Err(e) = $func(payload, client, response).await {
                    response.set_error(format!("{e:#}"));
                }
            }
        }
    };
}

command_handler!(RegisterVmCmd, register_vm);
command_handler!(AttachVmCmd, attach_vm);
command_handler!(UnregisterVmCmd, unregister_vm);
command_handler!(HyperCmd, hyper);
command_handler!(ConnectShimCmd, connect_shim);
command_handler!(DisconnectShimCmd, disconnect_shim);
command_handler!(SignalCmd, signal);

/// Empty payloads decode as `{}`.
fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let payload = if payload.is_empty() { b"{}".as_slice() } else { payload };
    Ok(serde_json::from_slice(payload)?)
}

async fn register_vm(payload: &[u8], client: &Client, response: &mut HandlerResponse) -> Result<()> {
    let payload: RegisterVm = decode(payload)?;
    if payload.container_id.is_empty() || payload.ctl_serial.is_empty() || payload.io_serial.is_empty() {
        bail!("malformed RegisterVM command");
    }

    let proxy = &client.proxy;
    let transport = HyperstartTransport::new(&payload.ctl_serial, &payload.io_serial);
    let vm = Arc::new(Vm::new(&payload.container_id, Arc::new(transport), proxy.engine()));
    if !proxy.add_vm(Arc::clone(&vm)).await {
        bail!("{}: container already registered", payload.container_id);
    }

    info!(
        client = client.id(),
        vm = %payload.container_id,
        ctl = %payload.ctl_serial,
        io = %payload.io_serial,
        console = payload.console.as_deref().unwrap_or(""),
        "RegisterVM"
    );

    if let Some(console) = payload.console.filter(|c| !c.is_empty()) {
        if proxy.enable_vm_console() {
            vm.set_console(console).await;
        }
    }

    let io = match proxy.allocate_tokens(&vm, payload.num_io_streams).await {
        Ok(io) => io,
        Err(e) => {
            proxy.remove_vm(vm.id()).await;
            proxy.drop_tokens(&vm).await;
            return Err(e.into());
        }
    };

    if let Err(e) = vm.connect().await {
        proxy.remove_vm(vm.id()).await;
        proxy.drop_tokens(&vm).await;
        vm.close().await;
        return Err(anyhow::Error::new(e).context(format!("{}: failed to connect to vm", vm.id())));
    }

    response.add_result("io", serde_json::to_value(io)?);
    client.state.lock().await.vm = Some(Arc::clone(&vm));
    proxy.supervise(vm);
    Ok(())
}

async fn attach_vm(payload: &[u8], client: &Client, response: &mut HandlerResponse) -> Result<()> {
    let payload: AttachVm = decode(payload)?;
    let vm = client
        .proxy
        .vm(&payload.container_id)
        .await
        .ok_or_else(|| anyhow!("unknown containerID: {}", payload.container_id))?;

    let io = client.proxy.allocate_tokens(&vm, payload.num_io_streams).await?;
    response.add_result("io", serde_json::to_value(io)?);

    info!(client = client.id(), vm = %payload.container_id, "AttachVM");
    client.state.lock().await.vm = Some(vm);
    Ok(())
}

/// Only hides the VM from the API; the VM itself is closed once its guest
/// goes away.
async fn unregister_vm(payload: &[u8], client: &Client, _response: &mut HandlerResponse) -> Result<()> {
    let payload: UnregisterVm = decode(payload)?;
    client
        .proxy
        .remove_vm(&payload.container_id)
        .await
        .ok_or_else(|| anyhow!("unknown containerID: {}", payload.container_id))?;

    info!(client = client.id(), vm = %payload.container_id, "UnregisterVM");
    client.state.lock().await.vm = None;
    Ok(())
}

async fn hyper(payload: &[u8], client: &Client, _response: &mut HandlerResponse) -> Result<()> {
    let mut hyper: Hyper = decode(payload)?;
    let vm = client
        .state
        .lock()
        .await
        .vm
        .clone()
        .ok_or_else(|| anyhow!("client not attached to a vm"))?;

    info!(client = client.id(), vm = %vm.id(), cmd = %hyper.hyper_name, "hyper");
    vm.send_message(&mut hyper).await?;
    Ok(())
}

async fn connect_shim(payload: &[u8], client: &Client, _response: &mut HandlerResponse) -> Result<()> {
    let payload: ConnectShim = decode(payload)?;
    let token = Token::from(payload.token);
    let vm = client.proxy.claim_token(&token).await.map_err(|e| anyhow!(e))?;

    let session = match vm.associate_shim(&token, client.handle.clone()).await {
        Ok(session) => session,
        Err(e) => {
            client.proxy.unclaim_token(&token).await;
            return Err(e.into());
        }
    };

    info!(client = client.id(), vm = %vm.id(), %token, io_base = session.io_base(), "ConnectShim");
    let mut state = client.state.lock().await;
    state.kind = ClientKind::Shim;
    state.token = Some(token);
    state.session = Some(session);
    Ok(())
}

async fn disconnect_shim(_payload: &[u8], client: &Client, _response: &mut HandlerResponse) -> Result<()> {
    let mut state = client.state.lock().await;
    if state.kind != ClientKind::Shim {
        bail!("client isn't a shim");
    }
    let token = state
        .token
        .clone()
        .ok_or_else(|| anyhow!("shim already disconnected"))?;

    let vm = client
        .proxy
        .release_token(&token)
        .await
        .ok_or_else(|| anyhow!("unknown token: {token}"))?;
    // detach first so freeing the session leaves this connection open
    if let Some(session) = &state.session {
        session.detach_client(client.id()).await;
    }
    vm.free_token(&token).await?;

    state.token = None;
    state.session = None;
    info!(client = client.id(), %token, "DisconnectShim");
    Ok(())
}

/// Signals at or above this are not real Unix signals.
const SIGNAL_LIMIT: i32 = 31;

fn signal_name(signal_number: i32) -> String {
    match UnixSignal::try_from(signal_number) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => signal_number.to_string(),
    }
}

/// Checks the signal number and that only SIGWINCH carries a window size.
/// Signal 0 is accepted and forwarded as is.
fn validate_signal(payload: &Signal) -> Result<i32> {
    let signal_number = payload.signal_number;
    if !(0..SIGNAL_LIMIT).contains(&signal_number) {
        bail!("invalid signal number {signal_number}");
    }
    let has_size = payload.columns != 0 || payload.rows != 0;
    if signal_number == UnixSignal::SIGWINCH as i32 {
        if payload.columns == 0 || payload.rows == 0 {
            bail!(
                "received SIGWINCH but terminal size is invalid ({},{})",
                payload.columns,
                payload.rows
            );
        }
    } else if has_size {
        bail!(
            "received a terminal size ({},{}) for signal {}",
            payload.columns,
            payload.rows,
            signal_name(signal_number)
        );
    }
    Ok(signal_number)
}

async fn signal(payload: &[u8], client: &Client, _response: &mut HandlerResponse) -> Result<()> {
    let session = {
        let state = client.state.lock().await;
        if state.kind != ClientKind::Shim {
            bail!("client isn't a shim");
        }
        state
            .session
            .clone()
            .ok_or_else(|| anyhow!("shim has no io session"))?
    };

    let payload: Signal = decode(payload)?;
    let signal = validate_signal(&payload)?;
    info!(client = client.id(), signal = %signal_name(signal), columns = payload.columns, rows = payload.rows, "Signal");

    session.wait_for_process(false).await?;
    if signal == UnixSignal::SIGWINCH as i32 {
        session.send_terminal_resize(payload.columns, payload.rows).await?;
    } else {
        session.send_signal(signal).await?;
    }
    Ok(())
}

struct StdinStream;

#[async_trait]
impl StreamHandler<Client> for StdinStream {
    async fn handle(&self, _stream: Stream, payload: &[u8], client: &Client) -> Result<(), VmError> {
        let session = client.state.lock().await.session.clone().ok_or_else(|| {
            VmError::InvalidPayload("stdin: client not associated with any io session".to_string())
        })?;
        session.forward_stdin(payload.to_vec()).await
    }
}

const LOG_SOURCES: &[&str] = &["shim", "runtime"];
const LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

fn validate_log_entry(entry: &LogEntry) -> Result<(), VmError> {
    if !LOG_SOURCES.contains(&entry.source.as_str()) {
        return Err(VmError::InvalidPayload(format!("invalid source: {}", entry.source)));
    }
    if !LOG_LEVELS.contains(&entry.level.as_str()) {
        return Err(VmError::InvalidPayload(format!("invalid level: {}", entry.level)));
    }
    if entry.message.is_empty() {
        return Err(VmError::InvalidPayload("no message specified".to_string()));
    }
    Ok(())
}

/// Re-emits runtime and shim log lines through the daemon's subscriber.
struct LogStream;

#[async_trait]
impl StreamHandler<Client> for LogStream {
    async fn handle(&self, _stream: Stream, payload: &[u8], client: &Client) -> Result<(), VmError> {
        let entry: LogEntry = serde_json::from_slice(payload)?;
        validate_log_entry(&entry)?;

        let container = entry.container_id.as_deref().unwrap_or("");
        let (source, msg, id) = (entry.source.as_str(), entry.message.as_str(), client.id());
        match entry.level.as_str() {
            "debug" => debug!(client = id, source, container, "{msg}"),
            "info" => info!(client = id, source, container, "{msg}"),
            "warn" => warn!(client = id, source, container, "{msg}"),
            _ => error!(client = id, source, container, "{msg}"),
        }
        Ok(())
    }
}
