//! In-process relay for tests and local development.
//!
//! [`MemoryHub`] plays the role of the remote relay: it routes each frame by
//! the envelope's `receiverId`, broadcasting when it is empty. It can also
//! refuse connections and cut or close links, which is how the reconnect
//! behaviour is exercised without a network.

use crate::transport::connector::{Connection, Connector, InboundFrame};
use crate::utils::{ChatError, Result, TransportError};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Endpoint name reported by memory connectors
pub const MEMORY_ENDPOINT: &str = "memory://hub";

/// In-process relay shared by any number of connectors
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<String, PeerLink>,
    next_link_id: u64,
    refuse_remaining: usize,
    attempts: Vec<(String, Instant)>,
}

struct PeerLink {
    link_id: u64,
    inbound: mpsc::UnboundedSender<Result<InboundFrame>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector attached to this hub
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { hub: self.clone() }
    }

    /// Identities with an open link
    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.lock().peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_next(&self, count: usize) {
        self.lock().refuse_remaining = count;
    }

    /// Time of every connection attempt seen for `identity`
    pub fn connect_attempts(&self, identity: &str) -> Vec<Instant> {
        self.lock()
            .attempts
            .iter()
            .filter(|(id, _)| id == identity)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Cut `identity`'s link without a close frame
    pub fn drop_peer(&self, identity: &str) -> bool {
        self.lock().peers.remove(identity).is_some()
    }

    /// Close `identity`'s link gracefully
    pub fn close_peer(&self, identity: &str) -> bool {
        match self.lock().peers.remove(identity) {
            Some(link) => link.inbound.unbounded_send(Ok(InboundFrame::Closed)).is_ok(),
            None => false,
        }
    }

    /// Deliver a raw frame to `identity`, bypassing routing
    pub fn inject(&self, identity: &str, frame: impl Into<String>) -> bool {
        match self.lock().peers.get(identity) {
            Some(link) => link
                .inbound
                .unbounded_send(Ok(InboundFrame::Text(frame.into())))
                .is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, identity: &str) -> Result<(u64, mpsc::UnboundedReceiver<Result<InboundFrame>>)> {
        let mut state = self.lock();
        state.attempts.push((identity.to_string(), Instant::now()));

        if state.refuse_remaining > 0 {
            state.refuse_remaining -= 1;
            return Err(TransportError::ConnectionFailed {
                endpoint: MEMORY_ENDPOINT.to_string(),
                reason: "connection refused".to_string(),
            }
            .into());
        }

        let (inbound, receiver) = mpsc::unbounded();
        state.next_link_id += 1;
        let link_id = state.next_link_id;
        state
            .peers
            .insert(identity.to_string(), PeerLink { link_id, inbound });
        Ok((link_id, receiver))
    }

    fn unregister(&self, identity: &str, link_id: u64) {
        let mut state = self.lock();
        if state.peers.get(identity).map(|link| link.link_id) == Some(link_id) {
            state.peers.remove(identity);
        }
    }

    fn route(&self, sender: &str, frame: String) {
        let receiver = match serde_json::from_str::<serde_json::Value>(&frame) {
            Ok(value) => value
                .get("receiverId")
                .and_then(|r| r.as_str())
                .unwrap_or_default()
                .to_string(),
            Err(e) => {
                log::debug!("Hub dropping unparseable frame from {}: {}", sender, e);
                return;
            }
        };

        let state = self.lock();
        if receiver.is_empty() {
            for (identity, link) in &state.peers {
                if identity != sender {
                    let _ = link.inbound.unbounded_send(Ok(InboundFrame::Text(frame.clone())));
                }
            }
        } else if let Some(link) = state.peers.get(&receiver) {
            let _ = link.inbound.unbounded_send(Ok(InboundFrame::Text(frame)));
        } else {
            log::debug!("Hub dropping frame for offline peer {}", receiver);
        }
    }
}

/// Connector that links to a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryConnector {
    hub: MemoryHub,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, identity: &str) -> Result<Connection> {
        let (link_id, inbound) = self.hub.register(identity)?;

        let (outbound, mut frames) = mpsc::unbounded::<String>();
        let hub = self.hub.clone();
        let sender = identity.to_string();
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                hub.route(&sender, frame);
            }
            hub.unregister(&sender, link_id);
        });

        let sink = outbound.sink_map_err(|_| ChatError::from(TransportError::ConnectionClosed));

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(inbound),
        })
    }

    fn endpoint(&self) -> &str {
        MEMORY_ENDPOINT
    }
}
