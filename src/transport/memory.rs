//! In-process links, for tests and for embedding against a local peer

use super::{ManagerTransport, SignalingTransport};
use crate::{
    error::TransportFailure,
    manager::{ManagerAction, ManagerMessage},
    signaling::{Envelope, InboundStanza},
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Sending half handed to a signaling connection.
#[derive(Debug)]
pub struct MemorySignalingTransport {
    sent: mpsc::UnboundedSender<Envelope>,
    refusing: Arc<AtomicBool>,
}

/// The remote end of an in-memory signaling link.
#[derive(Debug)]
pub struct SignalingPeer {
    sent: mpsc::UnboundedReceiver<Envelope>,
    inbound: mpsc::Sender<InboundStanza>,
    refusing: Arc<AtomicBool>,
}

/// Create a signaling link: transport, inbound receiver for the
/// connection, and the peer that plays the remote side.
pub fn signaling_link(
    capacity: usize,
) -> (
    MemorySignalingTransport,
    mpsc::Receiver<InboundStanza>,
    SignalingPeer,
) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
    let refusing = Arc::new(AtomicBool::new(false));
    (
        MemorySignalingTransport {
            sent: sent_tx,
            refusing: refusing.clone(),
        },
        inbound_rx,
        SignalingPeer {
            sent: sent_rx,
            inbound: inbound_tx,
            refusing,
        },
    )
}

#[async_trait]
impl SignalingTransport for MemorySignalingTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportFailure> {
        if self
            .refusing
            .load(Ordering::Relaxed)
        {
            return Err(TransportFailure::new("link refused the envelope"));
        }
        trace!("[MEMORY] {}", envelope);
        self.sent
            .send(envelope)
            .map_err(|_| TransportFailure::new("signaling peer closed"))
    }
}

impl SignalingPeer {
    /// Next envelope the connection sent, or `None` once it is gone.
    pub async fn next_sent(&mut self) -> Option<Envelope> {
        self.sent
            .recv()
            .await
    }

    /// Envelope already sent, without waiting.
    pub fn try_next_sent(&mut self) -> Option<Envelope> {
        self.sent
            .try_recv()
            .ok()
    }

    /// Deliver an inbound stanza to the connection.
    pub async fn deliver(&self, stanza: InboundStanza) -> bool {
        self.inbound
            .send(stanza)
            .await
            .is_ok()
    }

    /// Make every following send fail (or succeed again).
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing
            .store(refusing, Ordering::Relaxed);
    }
}

/// Sending half handed to a translator.
#[derive(Debug)]
pub struct MemoryManagerTransport {
    sent: mpsc::UnboundedSender<ManagerAction>,
    refusing: Arc<AtomicBool>,
}

/// The remote end of an in-memory switch-management link.
#[derive(Debug)]
pub struct ManagerPeer {
    sent: mpsc::UnboundedReceiver<ManagerAction>,
    inbound: mpsc::Sender<ManagerMessage>,
    refusing: Arc<AtomicBool>,
}

/// Create a switch-management link: transport, inbound receiver for the
/// translator, and the peer that plays the remote side.
pub fn manager_link(
    capacity: usize,
) -> (
    MemoryManagerTransport,
    mpsc::Receiver<ManagerMessage>,
    ManagerPeer,
) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
    let refusing = Arc::new(AtomicBool::new(false));
    (
        MemoryManagerTransport {
            sent: sent_tx,
            refusing: refusing.clone(),
        },
        inbound_rx,
        ManagerPeer {
            sent: sent_rx,
            inbound: inbound_tx,
            refusing,
        },
    )
}

#[async_trait]
impl ManagerTransport for MemoryManagerTransport {
    async fn send_action(&self, action: ManagerAction) -> Result<String, TransportFailure> {
        if self
            .refusing
            .load(Ordering::Relaxed)
        {
            return Err(TransportFailure::new("link refused the action"));
        }
        let action_id = action
            .action_id()
            .to_string();
        trace!("[MEMORY] action {} ({})", action.name(), action_id);
        self.sent
            .send(action)
            .map_err(|_| TransportFailure::new("manager peer closed"))?;
        Ok(action_id)
    }
}

impl ManagerPeer {
    /// Next action the translator sent, or `None` once it is gone.
    pub async fn next_sent(&mut self) -> Option<ManagerAction> {
        self.sent
            .recv()
            .await
    }

    /// Deliver an inbound message to the translator.
    pub async fn deliver(&self, message: ManagerMessage) -> bool {
        self.inbound
            .send(message)
            .await
            .is_ok()
    }

    /// Make every following send fail (or succeed again).
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing
            .store(refusing, Ordering::Relaxed);
    }
}
