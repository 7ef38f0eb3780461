use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Result, VmError};
use crate::guest::GuestTransport;
use crate::session::{
    ClientHandle, FIRST_IO_BASE, IoSession, NULL_SESSION_STDERR, NULL_SESSION_STDOUT,
    STREAMS_PER_SESSION,
};
use crate::token::{TOKEN_BYTES, Token};

type Slot = usize;

/// Sessions stored in an arena, indexed by sequence number and by token.
///
/// The two index maps are private and only touched by `insert` and `remove`,
/// so a session is always reachable through both or through neither.
struct SessionTable {
    slots: Vec<Option<Arc<IoSession>>>,
    free_slots: Vec<Slot>,
    by_seq: HashMap<u64, Slot>,
    by_token: HashMap<Token, Slot>,
    next_io_base: u64,
}

impl SessionTable {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_seq: HashMap::new(),
            by_token: HashMap::new(),
            next_io_base: FIRST_IO_BASE,
        }
    }

    fn insert(&mut self, session: Arc<IoSession>) -> Slot {
        let io_base = session.io_base();
        let token = session.token().cloned();
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(session);
                slot
            }
            None => {
                self.slots.push(Some(session));
                self.slots.len() - 1
            }
        };
        for seq in io_base..io_base + STREAMS_PER_SESSION {
            self.by_seq.insert(seq, slot);
        }
        if let Some(token) = token {
            self.by_token.insert(token, slot);
        }
        slot
    }

    fn remove(&mut self, slot: Slot) -> Option<Arc<IoSession>> {
        let session = self.slots.get_mut(slot)?.take()?;
        let io_base = session.io_base();
        for seq in io_base..io_base + STREAMS_PER_SESSION {
            self.by_seq.remove(&seq);
        }
        if let Some(token) = session.token() {
            self.by_token.remove(token);
        }
        self.free_slots.push(slot);
        Some(session)
    }

    fn get(&self, slot: Slot) -> Option<Arc<IoSession>> {
        self.slots.get(slot).and_then(|s| s.clone())
    }
}

/// All I/O sessions of one VM, plus its null session.
pub struct SessionRegistry {
    guest: Arc<dyn GuestTransport>,
    config: EngineConfig,
    null_session: Arc<IoSession>,
    table: Mutex<SessionTable>,
}

impl SessionRegistry {
    pub fn new(guest: Arc<dyn GuestTransport>, config: EngineConfig) -> Self {
        let null_session = Arc::new(IoSession::null(Arc::clone(&guest), config));
        debug_assert_eq!(null_session.io_base(), NULL_SESSION_STDOUT);
        debug_assert_eq!(null_session.stderr_seq(), NULL_SESSION_STDERR);

        let mut table = SessionTable::new();
        table.insert(Arc::clone(&null_session));

        Self {
            guest,
            config,
            null_session,
            table: Mutex::new(table),
        }
    }

    /// Create a session with a fresh token and the next pair of sequence
    /// numbers. If token generation fails the consumed pair is not reused.
    pub async fn allocate_token(&self) -> Result<Token> {
        let mut table = self.table.lock().await;
        let io_base = table.next_io_base;
        table.next_io_base += STREAMS_PER_SESSION;

        let token = Token::generate(TOKEN_BYTES)?;
        let session = Arc::new(IoSession::new(
            token.clone(),
            io_base,
            Arc::clone(&self.guest),
            self.config,
        ));
        table.insert(session);
        debug!(%token, io_base, "allocated io session");
        Ok(token)
    }

    pub async fn find_by_sequence(&self, seq: u64) -> Option<Arc<IoSession>> {
        let table = self.table.lock().await;
        let slot = *table.by_seq.get(&seq)?;
        table.get(slot)
    }

    pub async fn find_by_token(&self, token: &Token) -> Option<Arc<IoSession>> {
        let table = self.table.lock().await;
        let slot = *table.by_token.get(token)?;
        table.get(slot)
    }

    /// Bind `client` to the session owning `token` and fire its shim gate.
    pub async fn attach_client(
        &self,
        token: &Token,
        client: ClientHandle,
    ) -> Result<Arc<IoSession>> {
        let session = self
            .find_by_token(token)
            .await
            .ok_or_else(|| VmError::UnknownToken(token.to_string()))?;
        session.attach(client).await?;
        Ok(session)
    }

    /// Remove the session owning `token` from both indices and close its
    /// client.
    pub async fn free(&self, token: &Token) -> Result<()> {
        let session = {
            let mut table = self.table.lock().await;
            let slot = *table
                .by_token
                .get(token)
                .ok_or_else(|| VmError::UnknownToken(token.to_string()))?;
            table.remove(slot)
        };
        if let Some(session) = session {
            session.close().await;
            debug!(%token, io_base = session.io_base(), "freed io session");
        }
        Ok(())
    }

    /// Free every session, the null session included, leaving both indices
    /// empty. Safe to call more than once.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<IoSession>> = {
            let mut table = self.table.lock().await;
            (0..table.slots.len())
                .filter_map(|slot| table.remove(slot))
                .collect()
        };
        for session in sessions {
            session.close().await;
        }
    }

    pub fn null_session(&self) -> &Arc<IoSession> {
        &self.null_session
    }

    /// Number of live tokened sessions.
    pub async fn len(&self) -> usize {
        self.table.lock().await.by_token.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of sequence index entries, the null session's two included.
    pub async fn sequence_entries(&self) -> usize {
        self.table.lock().await.by_seq.len()
    }
}
