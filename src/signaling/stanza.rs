//! Stanza shapes at the signaling transport boundary
//!
//! The transport decodes each inbound stanza once into [`InboundStanza`];
//! the connection matches on it exhaustively.

use crate::{
    command::{CommandKind, Reference, SignalingCommand},
    error::TransportFailure,
    jid::Jid,
    node::Node,
    reason::CompletionReason,
};
use std::collections::BTreeMap;
use std::fmt;

define_parse_error!(
    /// Error returned when parsing an unknown IQ type.
    ParseIqTypeError,
    "iq type"
);

define_wire_enum! {
    error_type: ParseIqTypeError,
    /// Request/response stanza types.
    pub enum IqType {
        Get => "get",
        Set => "set",
        Result => "result",
        Error => "error",
    }
}

/// Outbound request stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Transport request id; the reply carries the same id.
    pub id: String,
    /// Destination address.
    pub to: Jid,
    /// Always [`IqType::Set`] for commands.
    pub iq_type: IqType,
    /// Command kind, for transports that build the document by kind.
    pub kind: CommandKind,
    /// Command payload element.
    pub payload: Node,
    /// Headers to attach to the payload.
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// `set` request carrying a signaling command.
    pub fn set(id: impl Into<String>, to: Jid, command: &SignalingCommand) -> Self {
        Self {
            id: id.into(),
            to,
            iq_type: IqType::Set,
            kind: command.kind(),
            payload: command
                .node()
                .clone(),
            headers: command
                .headers()
                .clone(),
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iq {} {} {} to {}", self.iq_type, self.id, self.kind, self.to)
    }
}

/// Error carried by an `error` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    /// Error type (`cancel`, `modify`, `wait`, ...).
    pub error_type: String,
    /// Defined condition (`item-not-found`, ...).
    pub condition: String,
    /// Optional descriptive text.
    pub text: Option<String>,
    /// The payload the error reply echoed back.
    pub payload: Option<Node>,
}

impl StanzaError {
    /// Error with type and condition.
    pub fn new(error_type: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            condition: condition.into(),
            text: None,
            payload: None,
        }
    }

    /// Attach descriptive text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Attach the echoed payload.
    pub fn with_payload(mut self, payload: Node) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Failure details suitable for an `Error` completion.
    pub fn details(&self) -> String {
        match &self.text {
            Some(text) => format!("{}: {} ({})", self.error_type, self.condition, text),
            None => format!("{}: {}", self.error_type, self.condition),
        }
    }
}

impl From<StanzaError> for TransportFailure {
    fn from(error: StanzaError) -> Self {
        let failure = TransportFailure::new(error.details()).with_condition(error.condition);
        match error.payload {
            Some(payload) => failure.with_payload(payload),
            None => failure,
        }
    }
}

/// Body of a `result` reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// Plain acknowledgement.
    Empty,
    /// A resource was created; later events refer to it by this id.
    Ref(Reference),
    /// Any other result payload.
    Node(Node),
}

impl ReplyBody {
    /// The created resource, if this is a resource acknowledgement.
    pub fn reference(&self) -> Option<&Reference> {
        match self {
            ReplyBody::Ref(reference) => Some(reference),
            _ => None,
        }
    }
}

/// What a pending request's slot receives.
pub type Reply = Result<ReplyBody, StanzaError>;

/// Event payload of a presence stanza.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum PresencePayload {
    /// New inbound call.
    Offer { headers: BTreeMap<String, String> },
    /// Far end answered.
    Answered,
    /// Far end ringing.
    Ringing,
    /// Call ended.
    End { reason: Option<String> },
    /// Informational notice.
    Info { name: String },
    /// A component finished.
    Complete(CompletionReason),
    /// Anything else.
    Other(Node),
}

/// Presence stanza: an event about a call or component.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    /// `call-id@domain[/component-id]`.
    pub from: Jid,
    /// Our address.
    pub to: Jid,
    /// Event payload.
    pub payload: PresencePayload,
}

/// Inbound stanza, decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum InboundStanza {
    /// Call or component event.
    Presence(Presence),
    /// Successful reply to one of our requests.
    Result {
        id: String,
        from: Jid,
        body: ReplyBody,
    },
    /// Error reply to one of our requests.
    Error {
        id: String,
        from: Jid,
        error: StanzaError,
    },
    /// Anything else (inbound `get`/`set`, messages, ...).
    Unsupported { description: String },
}

impl InboundStanza {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            InboundStanza::Presence(p) => format!("presence from {}", p.from),
            InboundStanza::Result { id, from, .. } => format!("result {} from {}", id, from),
            InboundStanza::Error { id, from, .. } => format!("error {} from {}", id, from),
            InboundStanza::Unsupported { description } => description.clone(),
        }
    }
}
