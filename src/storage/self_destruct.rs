//! Self-destructing messages.
//!
//! Content travels as `payload|ttlSeconds`. The payload is persisted right
//! away and a one-shot timer deletes it after the TTL. Timers live in
//! process memory only, so a restart leaves the record in place.

use crate::storage::{MessageRecord, MessageStore};
use crate::utils::{ProtocolError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Separator between payload and TTL
pub const TTL_SEPARATOR: char = '|';

/// Split `payload|ttlSeconds` at the first separator
///
/// A missing or non-numeric TTL yields 0, which means "never delete".
pub fn parse_self_destruct(content: &str) -> (&str, u64) {
    match content.split_once(TTL_SEPARATOR) {
        Some((payload, ttl)) => (payload, ttl.trim().parse().unwrap_or(0)),
        None => (content, 0),
    }
}

/// Build `payload|ttlSeconds` content
///
/// # Errors
///
/// Returns `ProtocolError::InvalidEnvelope` if the payload contains the
/// separator, since the receiver splits at its first occurrence.
pub fn format_self_destruct(payload: &str, ttl_seconds: u64) -> Result<String> {
    if payload.contains(TTL_SEPARATOR) {
        return Err(ProtocolError::InvalidEnvelope {
            reason: format!("self-destruct payload must not contain '{TTL_SEPARATOR}'"),
        }
        .into());
    }
    Ok(format!("{payload}{TTL_SEPARATOR}{ttl_seconds}"))
}

/// Replace `payload|ttlSeconds` content by the payload and record the TTL
///
/// Returns the parsed TTL.
pub fn apply_self_destruct(record: &mut MessageRecord) -> u64 {
    let ttl = match record.content.as_deref() {
        Some(content) => {
            let (payload, ttl) = parse_self_destruct(content);
            let payload = payload.to_string();
            record.content = Some(payload);
            ttl
        }
        None => 0,
    };
    record.ttl_seconds = (ttl > 0).then_some(ttl);
    ttl
}

/// Persists self-destructing records and deletes them when their TTL ends
#[derive(Clone)]
pub struct SelfDestructScheduler {
    store: Arc<dyn MessageStore>,
    shutdown: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl SelfDestructScheduler {
    /// Create a scheduler deleting from `store`
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            shutdown: CancellationToken::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Persist `record` and arm a deletion timer for its `ttl_seconds`
    pub fn schedule(&self, record: MessageRecord) -> Result<Uuid> {
        let ttl = record.ttl_seconds.unwrap_or(0);
        let id = self.store.insert(record)?;
        if ttl > 0 {
            self.arm(id, Duration::from_secs(ttl));
        }
        Ok(id)
    }

    /// Number of armed timers
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Cancel every armed timer; the records stay
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn arm(&self, id: Uuid, ttl: Duration) {
        let store = Arc::clone(&self.store);
        let shutdown = self.shutdown.clone();
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::SeqCst);
        log::debug!("Message {} self-destructs in {:?}", id, ttl);

        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {
                    log::debug!("Self-destruct timer for {} cancelled", id);
                }
                () = tokio::time::sleep(ttl) => match store.delete(&id) {
                    Ok(true) => log::info!("Message {} self-destructed", id),
                    Ok(false) => log::debug!("Message {} was already deleted", id),
                    Err(e) => log::warn!("Failed to delete self-destructing message {}: {}", id, e),
                },
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryMessageStore;
    use crate::transport::protocol::MessageKind;
    use crate::utils::ChatError;

    fn accept(scheduler: &SelfDestructScheduler, mut record: MessageRecord) -> Result<(Uuid, u64)> {
        let ttl = apply_self_destruct(&mut record);
        Ok((scheduler.schedule(record)?, ttl))
    }

    fn setup() -> (Arc<MemoryMessageStore>, SelfDestructScheduler) {
        let store = Arc::new(MemoryMessageStore::new());
        let scheduler = SelfDestructScheduler::new(store.clone());
        (store, scheduler)
    }

    fn record(content: &str) -> MessageRecord {
        MessageRecord::new(
            "direct:alice:bob",
            "bob",
            MessageKind::SelfDestruct,
            Some(content.to_string()),
            1,
        )
    }

    #[test]
    fn test_parse_self_destruct() {
        assert_eq!(parse_self_destruct("hello|2"), ("hello", 2));
        assert_eq!(parse_self_destruct("hello|0"), ("hello", 0));
        assert_eq!(parse_self_destruct("hello|x"), ("hello", 0));
        assert_eq!(parse_self_destruct("hello"), ("hello", 0));
        assert_eq!(parse_self_destruct("a|b|3"), ("a", 0));
        assert_eq!(format_self_destruct("hello", 2).unwrap(), "hello|2");
        assert_eq!(
            parse_self_destruct(&format_self_destruct("two words", 5).unwrap()),
            ("two words", 5)
        );
    }

    #[test]
    fn test_payload_with_separator_is_rejected() {
        assert!(matches!(
            format_self_destruct("price a|b", 2),
            Err(ChatError::Protocol(ProtocolError::InvalidEnvelope { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_is_deleted_after_ttl() {
        let (store, scheduler) = setup();
        let (id, ttl) = accept(&scheduler, record("hello|2")).unwrap();
        assert_eq!(ttl, 2);

        let stored = store.messages_for_chat("direct:alice:bob").unwrap();
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].content.as_deref(), Some("hello"));
        assert_eq!(stored[0].ttl_seconds, Some(2));
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.is_empty());
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_or_invalid_ttl_never_deletes() {
        let (store, scheduler) = setup();
        assert_eq!(accept(&scheduler, record("hello|0")).unwrap().1, 0);
        assert_eq!(accept(&scheduler, record("hello|x")).unwrap().1, 0);
        assert_eq!(scheduler.pending(), 0);

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        let stored = store.messages_for_chat("direct:alice:bob").unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.content.as_deref() == Some("hello")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timers() {
        let (store, scheduler) = setup();
        accept(&scheduler, record("hello|5")).unwrap();
        scheduler.shutdown();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        let (store, scheduler) = setup();
        store.set_available(false);
        assert!(accept(&scheduler, record("hello|2")).is_err());
        assert_eq!(scheduler.pending(), 0);
    }
}
