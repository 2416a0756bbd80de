//! Transport boundaries
//!
//! Each link is a sending half implementing one of these traits plus an
//! `mpsc::Receiver` of decoded inbound messages, drained by exactly one
//! reader task.

pub mod memory;

use crate::{error::TransportFailure, manager::ManagerAction, signaling::Envelope};
use async_trait::async_trait;

/// Sending half of a stanza-exchange transport.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Put an envelope on the wire.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportFailure>;
}

/// Sending half of a switch-management transport.
#[async_trait]
pub trait ManagerTransport: Send + Sync {
    /// Put an action on the wire and return the correlation id its replies
    /// and events will carry (normally the action's own `ActionID`).
    ///
    /// Replies under a different id may reach the inbound side before this
    /// returns; the translator holds them until the id is known.
    async fn send_action(&self, action: ManagerAction) -> Result<String, TransportFailure>;
}
