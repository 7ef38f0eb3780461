//! Rewrites the stream sequence numbers of process-creating guest commands
//! so the guest tags the process output with the session's ioBase.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use vmproxy_protocol::Hyper;

use crate::error::{Result, VmError};
use crate::guest::{EXEC_CMD, NEW_CONTAINER};
use crate::registry::SessionRegistry;
use crate::session::IoSession;
use crate::token::Token;

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Guest process descriptor. Only the fields relocation reads or writes are
/// typed, everything else is carried through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stdio: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stderr: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecCommand {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    pub process: Process,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NewContainer {
    #[serde(default)]
    pub id: String,
    pub process: Process,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relocatable {
    NewContainer,
    ExecCmd,
}

impl Relocatable {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            NEW_CONTAINER => Some(Self::NewContainer),
            EXEC_CMD => Some(Self::ExecCmd),
            _ => None,
        }
    }
}

fn relocate_process(command: &str, process: &mut Process, session: &IoSession) -> Result<()> {
    if process.stdio != 0 {
        return Err(VmError::SequenceAlreadySet {
            command: command.to_string(),
            field: "stdio",
            value: process.stdio,
        });
    }
    if process.stderr != 0 {
        return Err(VmError::SequenceAlreadySet {
            command: command.to_string(),
            field: "stderr",
            value: process.stderr,
        });
    }

    process.stdio = session.io_base();
    // a terminal multiplexes stderr onto stdio, the guest rejects a stderr seq
    if !process.terminal {
        process.stderr = session.stderr_seq();
    }
    Ok(())
}

fn decode<T: for<'de> Deserialize<'de>>(command: &str, data: Option<&Value>) -> Result<T> {
    let data = data.ok_or_else(|| VmError::MalformedCommand {
        command: command.to_string(),
        reason: "missing data".to_string(),
    })?;
    serde_json::from_value(data.clone()).map_err(|e| VmError::MalformedCommand {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

/// Resolve the session addressed by `hyper` and rewrite its process stream
/// fields in place, then wait for that session's shim.
///
/// Returns `None` for commands that do not create a process. `hyper` is left
/// untouched when validation fails; a shim wait timeout is reported after the
/// rewrite.
pub async fn relocate(
    registry: &SessionRegistry,
    hyper: &mut Hyper,
) -> Result<Option<Arc<IoSession>>> {
    let n_tokens = hyper.tokens.len();
    let Some(kind) = Relocatable::from_name(&hyper.hyper_name) else {
        if n_tokens > 0 {
            return Err(VmError::UnexpectedTokens(hyper.hyper_name.clone()));
        }
        return Ok(None);
    };

    if n_tokens > 1 {
        return Err(VmError::TooManyTokens {
            command: hyper.hyper_name.clone(),
            count: n_tokens,
        });
    }

    let session = match hyper.tokens.first() {
        None => Arc::clone(registry.null_session()),
        Some(raw) => {
            let token = Token::from(raw.as_str());
            registry
                .find_by_token(&token)
                .await
                .ok_or_else(|| VmError::UnknownToken(raw.clone()))?
        }
    };

    let name = hyper.hyper_name.as_str();
    let (data, container_id) = match kind {
        Relocatable::ExecCmd => {
            let mut cmd: ExecCommand = decode(name, hyper.data.as_ref())?;
            relocate_process(name, &mut cmd.process, &session)?;
            (serde_json::to_value(&cmd)?, None)
        }
        Relocatable::NewContainer => {
            let mut cmd: NewContainer = decode(name, hyper.data.as_ref())?;
            relocate_process(name, &mut cmd.process, &session)?;
            let id = cmd.id.clone();
            (serde_json::to_value(&cmd)?, Some(id))
        }
    };

    hyper.data = Some(data);
    if let Some(id) = container_id.filter(|id| !id.is_empty()) {
        if !session.is_null() {
            session.set_container_id(id).await;
        }
    }
    debug!(
        command = name,
        io_base = session.io_base(),
        null = session.is_null(),
        "relocated guest command"
    );

    session.wait_for_shim().await?;
    Ok(Some(session))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::guest::memory::MemoryTransport;
    use crate::session::{ClientHandle, FIRST_IO_BASE, NULL_SESSION_STDOUT};

    fn registry() -> SessionRegistry {
        let (transport, _guest) = MemoryTransport::pair();
        SessionRegistry::new(
            Arc::new(transport),
            EngineConfig::with_timeouts(Duration::from_millis(50), Duration::from_millis(50)),
        )
    }

    fn hyper(name: &str, tokens: Vec<String>, data: Value) -> Hyper {
        Hyper {
            hyper_name: name.to_string(),
            tokens,
            data: Some(data),
        }
    }

    async fn attached_token(reg: &SessionRegistry) -> Token {
        let token = reg.allocate_token().await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let (client, _closed) = ClientHandle::new(1, tx);
        reg.attach_client(&token, client).await.unwrap();
        token
    }

    #[tokio::test]
    async fn exec_without_terminal_gets_both_streams() {
        let reg = registry();
        let token = attached_token(&reg).await;
        let mut cmd = hyper(
            EXEC_CMD,
            vec![token.to_string()],
            json!({"container": "c", "process": {"terminal": false, "args": ["sh"]}}),
        );
        let session = relocate(&reg, &mut cmd).await.unwrap().unwrap();
        assert_eq!(session.io_base(), FIRST_IO_BASE);

        let data = cmd.data.unwrap();
        assert_eq!(data["process"]["stdio"], json!(FIRST_IO_BASE));
        assert_eq!(data["process"]["stderr"], json!(FIRST_IO_BASE + 1));
        assert_eq!(data["process"]["args"], json!(["sh"]));
        assert_eq!(data["container"], json!("c"));
    }

    #[tokio::test]
    async fn terminal_exec_leaves_stderr_unset() {
        let reg = registry();
        let token = attached_token(&reg).await;
        let mut cmd = hyper(
            EXEC_CMD,
            vec![token.to_string()],
            json!({"process": {"terminal": true, "args": ["sh"]}}),
        );
        relocate(&reg, &mut cmd).await.unwrap();
        let process: Process =
            serde_json::from_value(cmd.data.unwrap()["process"].clone()).unwrap();
        assert_eq!(process.stdio, FIRST_IO_BASE);
        assert_eq!(process.stderr, 0);
    }

    #[tokio::test]
    async fn newcontainer_without_token_uses_null_session() {
        let reg = registry();
        let mut cmd = hyper(
            NEW_CONTAINER,
            Vec::new(),
            json!({"id": "pod", "rootfs": "rootfs", "process": {"args": ["/pause"]}}),
        );
        let started = tokio::time::Instant::now();
        let session = relocate(&reg, &mut cmd).await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(session.is_null());
        assert!(session.container_id().await.is_none());

        let data = cmd.data.unwrap();
        assert_eq!(data["process"]["stdio"], json!(NULL_SESSION_STDOUT));
        assert_eq!(data["rootfs"], json!("rootfs"));
    }

    #[tokio::test]
    async fn newcontainer_records_container_id() {
        let reg = registry();
        let token = attached_token(&reg).await;
        let mut cmd = hyper(
            NEW_CONTAINER,
            vec![token.to_string()],
            json!({"id": "c42", "process": {"args": ["true"]}}),
        );
        let session = relocate(&reg, &mut cmd).await.unwrap().unwrap();
        assert_eq!(session.container_id().await.as_deref(), Some("c42"));
    }

    #[tokio::test]
    async fn newcontainer_without_id_leaves_session_unbound() {
        let reg = registry();
        let token = attached_token(&reg).await;
        let mut cmd = hyper(
            NEW_CONTAINER,
            vec![token.to_string()],
            json!({"process": {"args": ["true"]}}),
        );
        let session = relocate(&reg, &mut cmd).await.unwrap().unwrap();
        assert!(session.container_id().await.is_none());
        assert!(matches!(
            session.send_signal(15).await,
            Err(VmError::NoContainer)
        ));
    }

    #[tokio::test]
    async fn two_tokens_are_rejected_untouched() {
        let reg = registry();
        let a = attached_token(&reg).await;
        let b = attached_token(&reg).await;
        let original = hyper(
            EXEC_CMD,
            vec![a.to_string(), b.to_string()],
            json!({"process": {"args": ["sh"]}}),
        );
        let mut cmd = original.clone();
        let err = relocate(&reg, &mut cmd).await.unwrap_err();
        assert!(matches!(err, VmError::TooManyTokens { count: 2, .. }));
        assert_eq!(cmd, original);
    }

    #[tokio::test]
    async fn prefilled_sequence_is_rejected() {
        let reg = registry();
        let token = attached_token(&reg).await;
        let original = hyper(
            EXEC_CMD,
            vec![token.to_string()],
            json!({"process": {"stdio": 9, "args": ["sh"]}}),
        );
        let mut cmd = original.clone();
        let err = relocate(&reg, &mut cmd).await.unwrap_err();
        assert!(matches!(
            err,
            VmError::SequenceAlreadySet {
                field: "stdio",
                value: 9,
                ..
            }
        ));
        assert_eq!(cmd, original);

        let mut cmd = hyper(
            EXEC_CMD,
            vec![token.to_string()],
            json!({"process": {"stderr": 4, "args": ["sh"]}}),
        );
        let err = relocate(&reg, &mut cmd).await.unwrap_err();
        assert!(matches!(
            err,
            VmError::SequenceAlreadySet {
                field: "stderr",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let reg = registry();
        let mut cmd = hyper(
            EXEC_CMD,
            vec!["bogus".to_string()],
            json!({"process": {"args": ["sh"]}}),
        );
        let err = relocate(&reg, &mut cmd).await.unwrap_err();
        assert!(matches!(err, VmError::UnknownToken(_)));
    }

    #[tokio::test]
    async fn tokens_on_other_commands_are_rejected() {
        let reg = registry();
        let token = attached_token(&reg).await;
        let mut cmd = hyper("ping", vec![token.to_string()], json!({}));
        let err = relocate(&reg, &mut cmd).await.unwrap_err();
        assert!(matches!(err, VmError::UnexpectedTokens(_)));

        let mut cmd = hyper("ping", Vec::new(), json!({}));
        assert!(relocate(&reg, &mut cmd).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn waits_for_shim_after_rewrite() {
        let reg = registry();
        let token = reg.allocate_token().await.unwrap();
        let mut cmd = hyper(
            EXEC_CMD,
            vec![token.to_string()],
            json!({"process": {"args": ["sh"]}}),
        );
        let err = relocate(&reg, &mut cmd).await.unwrap_err();
        assert!(err.is_timeout());

        // a late shim can still attach
        let (tx, _rx) = mpsc::channel(1);
        let (client, _closed) = ClientHandle::new(3, tx);
        reg.attach_client(&token, client).await.unwrap();
    }
}
