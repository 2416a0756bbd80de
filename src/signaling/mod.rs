//! Signaling link: blocking-style command writes over an asynchronous
//! stanza exchange

pub mod connection;
pub mod stanza;

pub use connection::{SignalingConnection, SignalingOptions};
pub use stanza::{
    Envelope, InboundStanza, IqType, ParseIqTypeError, Presence, PresencePayload, Reply,
    ReplyBody, StanzaError,
};
