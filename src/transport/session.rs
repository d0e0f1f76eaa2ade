//! Transport Session Manager.
//!
//! Owns the single logical connection of the local identity. A supervising
//! task opens the stream through a [`Connector`], feeds every parsed
//! envelope into one ordered channel and reconnects with exponential
//! backoff until [`TransportSession::disconnect`] is called.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Error -> Connecting -> ...
//!                                   |
//!                                   +-> Disconnected (graceful close)
//! ```

use crate::transport::backoff::Backoff;
use crate::transport::connector::{Connection, Connector, FrameSink, InboundFrame};
use crate::transport::protocol::{ConnectionState, Envelope};
use crate::utils::{ReconnectConfig, Result, TransportConfig, TransportError};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Event delivered to the router, in wire order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connection was just opened; no frame of it has been delivered yet
    Opened,
    /// The connection state changed
    StateChanged(ConnectionState),
    /// An inbound envelope
    Envelope(Envelope),
}

struct Shared {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    max_frame_size: usize,
    base_delay: Duration,
    max_delay: Duration,
    sink: Mutex<Option<FrameSink>>,
    state: watch::Sender<ConnectionState>,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<SessionEvent>,
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum LinkEnd {
    Cancelled,
    Graceful,
    Lost(String),
}

/// Single logical connection with automatic reconnect
pub struct TransportSession {
    shared: Arc<Shared>,
    supervisor: std::sync::Mutex<Option<Supervisor>>,
}

/// Cloneable sending half of a [`TransportSession`]
#[derive(Clone)]
pub struct Outbound {
    shared: Arc<Shared>,
}

impl TransportSession {
    /// Create a session and the receiver of its events
    pub fn new(
        connector: Arc<dyn Connector>,
        transport: &TransportConfig,
        reconnect: &ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            connector,
            connect_timeout: transport.connect_timeout(),
            max_frame_size: transport.max_frame_size,
            base_delay: reconnect.base_delay(),
            max_delay: reconnect.max_delay(),
            sink: Mutex::new(None),
            state,
            closed: AtomicBool::new(false),
            events,
        });

        let session = Self {
            shared,
            supervisor: std::sync::Mutex::new(None),
        };
        (session, receiver)
    }

    /// Start connecting as `identity`
    ///
    /// Spawns the supervising task and returns immediately; progress is
    /// reported through [`SessionEvent::StateChanged`]. Does nothing while a
    /// supervisor is already running.
    pub fn connect(&self, identity: &str) {
        let mut supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(running) = supervisor.as_ref() {
            if !running.handle.is_finished() {
                log::debug!("Session for {} already running", identity);
                return;
            }
        }

        self.shared.closed.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            identity.to_string(),
            cancel.clone(),
        ));
        *supervisor = Some(Supervisor { cancel, handle });
    }

    /// Stop reconnecting and close the open stream
    ///
    /// Every send issued afterwards fails with `TransportError::ConnectionClosed`.
    pub async fn disconnect(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);

        let running = self
            .supervisor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        if let Some(Supervisor { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                log::warn!("Session supervisor ended abnormally: {}", e);
            }
        }

        self.shared.close_sink().await;
        self.shared.set_state(ConnectionState::Disconnected);
        log::info!("Disconnected from {}", self.shared.connector.endpoint());
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Handle for sending envelopes
    pub fn outbound(&self) -> Outbound {
        Outbound {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        let supervisor = self
            .supervisor
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(running) = supervisor.take() {
            running.cancel.cancel();
        }
    }
}

impl Outbound {
    /// Send one envelope on the current connection
    ///
    /// # Errors
    ///
    /// `TransportError::ConnectionClosed` after `disconnect()`,
    /// `TransportError::NotConnected` while no stream is open, or the
    /// stream's own error if the write fails.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed.into());
        }
        let frame = envelope.to_json()?;

        let mut guard = self.shared.sink.lock().await;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed.into());
        }
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;

        if let Err(e) = sink.send(frame).await {
            log::warn!("Send failed, dropping stream: {}", e);
            *guard = None;
            return Err(e);
        }

        log::debug!(
            "Sent {} to {}",
            envelope.kind,
            if envelope.is_broadcast() { "*" } else { envelope.receiver_id.as_str() }
        );
        Ok(())
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });

        if changed {
            log::debug!("Connection state: {}", next);
            let _ = self.events.send(SessionEvent::StateChanged(next));
        }
    }

    async fn close_sink(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                log::debug!("Closing stream: {}", e);
            }
        }
    }

    async fn run_connection(&self, connection: Connection, cancel: &CancellationToken) -> LinkEnd {
        let Connection { sink, mut stream } = connection;
        *self.sink.lock().await = Some(sink);
        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(SessionEvent::Opened);

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return LinkEnd::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(InboundFrame::Text(frame))) => {
                    match Envelope::from_json(&frame, self.max_frame_size) {
                        Ok(envelope) => {
                            if self.events.send(SessionEvent::Envelope(envelope)).is_err() {
                                log::debug!("No router listening, frame dropped");
                            }
                        }
                        Err(e) => log::warn!("Dropping inbound frame: {}", e),
                    }
                }
                Some(Ok(InboundFrame::Closed)) => {
                    self.sink.lock().await.take();
                    return LinkEnd::Graceful;
                }
                Some(Err(e)) => {
                    self.sink.lock().await.take();
                    return LinkEnd::Lost(e.to_string());
                }
                None => {
                    self.sink.lock().await.take();
                    return LinkEnd::Lost("stream ended".to_string());
                }
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>, identity: String, cancel: CancellationToken) {
    let endpoint = shared.connector.endpoint().to_string();
    let mut backoff = Backoff::new(shared.base_delay, shared.max_delay);

    loop {
        shared.set_state(ConnectionState::Connecting);

        let attempt = tokio::time::timeout(shared.connect_timeout, shared.connector.connect(&identity));
        let outcome = tokio::select! {
            () = cancel.cancelled() => break,
            result = attempt => result.unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    operation: format!("connect to {endpoint}"),
                }
                .into())
            }),
        };

        match outcome {
            Ok(connection) => {
                log::info!("Connected to {} as {}", endpoint, identity);
                backoff.reset();
                match shared.run_connection(connection, &cancel).await {
                    LinkEnd::Cancelled => break,
                    LinkEnd::Graceful => {
                        log::info!("Remote closed the connection");
                        shared.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    LinkEnd::Lost(reason) => {
                        log::warn!("Connection lost: {}", reason);
                        shared.set_state(ConnectionState::Error(reason));
                    }
                }
            }
            Err(e) => {
                log::warn!("Connect to {} failed: {}", endpoint, e);
                shared.set_state(ConnectionState::Error(e.to_string()));
            }
        }

        let delay = backoff.next_delay();
        log::info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    shared.close_sink().await;
    shared.set_state(ConnectionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use crate::transport::protocol::MessageKind;
    use crate::utils::ChatError;

    fn session(hub: &MemoryHub) -> (TransportSession, mpsc::UnboundedReceiver<SessionEvent>) {
        TransportSession::new(
            Arc::new(hub.connector()),
            &TransportConfig::default(),
            &ReconnectConfig::default(),
        )
    }

    async fn wait_for_state(session: &TransportSession, wanted: ConnectionState) {
        let mut states = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(600), states.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn gaps(attempts: &[tokio::time::Instant]) -> Vec<Duration> {
        attempts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn assert_close(actual: Duration, expected_secs: u64) {
        let expected = Duration::from_secs(expected_secs);
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(50),
            "gap {actual:?}, expected {expected:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_on_refusals() {
        let hub = MemoryHub::new();
        hub.refuse_next(7);
        let (session, _events) = session(&hub);

        session.connect("alice");
        wait_for_state(&session, ConnectionState::Connected).await;

        let attempts = hub.connect_attempts("alice");
        assert_eq!(attempts.len(), 8);
        for (gap, expected) in gaps(&attempts).into_iter().zip([1, 2, 4, 8, 16, 30, 30]) {
            assert_close(gap, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_loss_starts_from_base_delay() {
        let hub = MemoryHub::new();
        hub.refuse_next(3);
        let (session, _events) = session(&hub);

        session.connect("alice");
        wait_for_state(&session, ConnectionState::Connected).await;
        assert!(hub.drop_peer("alice"));

        tokio::time::timeout(Duration::from_secs(60), async {
            while hub.connect_attempts("alice").len() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        wait_for_state(&session, ConnectionState::Connected).await;

        let attempts = hub.connect_attempts("alice");
        assert_close(attempts[4] - attempts[3], 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let hub = MemoryHub::new();
        let (session, mut events) = session(&hub);

        session.connect("alice");
        wait_for_state(&session, ConnectionState::Connected).await;

        let valid = Envelope::new("bob", "alice", "", MessageKind::Other("PING".to_string()), None);
        assert!(hub.inject("alice", "{not json"));
        assert!(hub.inject("alice", valid.to_json().unwrap()));

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, SessionEvent::Envelope(_));
            seen.push(event);
            if done {
                break;
            }
        }

        assert_eq!(
            seen,
            vec![
                SessionEvent::StateChanged(ConnectionState::Connecting),
                SessionEvent::StateChanged(ConnectionState::Connected),
                SessionEvent::Opened,
                SessionEvent::Envelope(valid),
            ]
        );
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(hub.connect_attempts("alice").len(), 1);
    }

    #[tokio::test]
    async fn test_send_between_sessions() {
        let hub = MemoryHub::new();
        let (alice, _alice_events) = session(&hub);
        let (bob, mut bob_events) = session(&hub);

        alice.connect("alice");
        bob.connect("bob");
        wait_for_state(&alice, ConnectionState::Connected).await;
        wait_for_state(&bob, ConnectionState::Connected).await;

        let envelope = Envelope::new("alice", "bob", "direct:alice:bob", MessageKind::Text, None);
        alice.outbound().send(&envelope).await.unwrap();

        loop {
            match bob_events.recv().await {
                Some(SessionEvent::Envelope(received)) => {
                    assert_eq!(received, envelope);
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails_fast() {
        let hub = MemoryHub::new();
        let (session, _events) = session(&hub);
        let outbound = session.outbound();

        session.connect("alice");
        wait_for_state(&session, ConnectionState::Connected).await;
        session.disconnect().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        let envelope = Envelope::key_exchange("alice", "", "AAAA".to_string());
        assert!(matches!(
            outbound.send(&envelope).await,
            Err(ChatError::Transport(TransportError::ConnectionClosed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_reconnecting_is_not_connected() {
        let hub = MemoryHub::new();
        hub.refuse_next(usize::MAX);
        let (session, _events) = session(&hub);

        session.connect("alice");
        tokio::time::sleep(Duration::from_millis(500)).await;

        let envelope = Envelope::key_exchange("alice", "", "AAAA".to_string());
        assert!(matches!(
            session.outbound().send(&envelope).await,
            Err(ChatError::Transport(TransportError::NotConnected))
        ));
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_does_not_retry() {
        let hub = MemoryHub::new();
        let (session, _events) = session(&hub);

        session.connect("alice");
        wait_for_state(&session, ConnectionState::Connected).await;
        assert!(hub.close_peer("alice"));
        wait_for_state(&session, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(hub.connect_attempts("alice").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_stops_attempts() {
        let hub = MemoryHub::new();
        hub.refuse_next(usize::MAX);
        let (session, _events) = session(&hub);

        session.connect("alice");
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let before = hub.connect_attempts("alice").len();
        assert_eq!(before, 2);

        session.disconnect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(hub.connect_attempts("alice").len(), before);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
