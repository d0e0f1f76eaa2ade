//! Message persistence collaborator.
//!
//! The core does not own a storage schema. It hands [`MessageRecord`]s to a
//! [`MessageStore`] and asks for them back by chat-id; the self-destruct
//! scheduler deletes them by record id.

pub mod self_destruct;

use crate::transport::protocol::MessageKind;
use crate::utils::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

pub use self_destruct::{
    apply_self_destruct, format_self_destruct, parse_self_destruct, SelfDestructScheduler,
};

/// One persisted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Record identifier
    pub id: Uuid,
    /// Conversation the message belongs to
    pub chat_id: String,
    /// Identity of the author
    pub sender_id: String,
    /// Message kind
    pub kind: MessageKind,
    /// Plaintext, or the undecrypted wire content when no key opened it
    pub content: Option<String>,
    /// Unix time in milliseconds
    pub timestamp: i64,
    /// Seconds until deletion, for self-destruct messages
    pub ttl_seconds: Option<u64>,
    /// True for messages written by the local identity
    pub outgoing: bool,
}

impl MessageRecord {
    /// Create a record with a fresh id
    pub fn new(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        kind: MessageKind,
        content: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            kind,
            content,
            timestamp,
            ttl_seconds: None,
            outgoing: false,
        }
    }

    /// Mark the record as written locally
    pub fn outgoing(mut self) -> Self {
        self.outgoing = true;
        self
    }
}

/// Record storage owned by the host application
pub trait MessageStore: Send + Sync {
    /// Persist a record, returning its id
    fn insert(&self, record: MessageRecord) -> Result<Uuid>;

    /// Remove a record; false if it did not exist
    fn delete(&self, id: &Uuid) -> Result<bool>;

    /// Records of one chat ordered by timestamp
    fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<MessageRecord>>;
}

/// Process-memory [`MessageStore`]
#[derive(Default)]
pub struct MemoryMessageStore {
    records: RwLock<HashMap<Uuid, MessageRecord>>,
    unavailable: AtomicBool,
}

impl MemoryMessageStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going away or coming back
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or_default()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "message store offline".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl MessageStore for MemoryMessageStore {
    fn insert(&self, record: MessageRecord) -> Result<Uuid> {
        self.check_available()?;
        let id = record.id;
        self.records
            .write()
            .map_err(StorageError::from)?
            .insert(id, record);
        Ok(id)
    }

    fn delete(&self, id: &Uuid) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .records
            .write()
            .map_err(StorageError::from)?
            .remove(id)
            .is_some())
    }

    fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<MessageRecord>> {
        self.check_available()?;
        let mut messages: Vec<MessageRecord> = self
            .records
            .read()
            .map_err(StorageError::from)?
            .values()
            .filter(|record| record.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by_key(|record| record.timestamp);
        Ok(messages)
    }
}
