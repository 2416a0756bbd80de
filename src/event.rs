//! Events delivered to application code and the stream that carries them

use crate::{
    command::CommandId,
    error::CallCtlError,
    jid::Jid,
    node::Node,
    reason::{Attributes, CompletionReason},
};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::warn;

define_parse_error!(
    /// Error returned when parsing an unknown link name.
    ParseLinkError,
    "link"
);

define_wire_enum! {
    error_type: ParseLinkError,
    /// The two transports feeding the event stream.
    pub enum Link {
        Signaling => "signaling",
        Manager => "manager",
    }
}

/// Connection status of a link
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// Reader task is running.
    Connected,
    /// Reader task ended.
    Disconnected(DisconnectReason),
}

/// Reason a link's reader task ended
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The remote side sent a message of an unexpected shape
    ProtocolViolation(String),
    /// The transport's inbound stream ended
    InboundClosed,
    /// The application dropped the event stream
    EventStreamClosed,
    /// The reader task panicked
    ReaderPanicked,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            DisconnectReason::InboundClosed => write!(f, "inbound stream closed"),
            DisconnectReason::EventStreamClosed => write!(f, "event stream dropped"),
            DisconnectReason::ReaderPanicked => write!(f, "reader task panicked"),
        }
    }
}

/// A new inbound call, built from an offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    call_id: String,
    to: Jid,
    headers: BTreeMap<String, String>,
}

impl Call {
    pub(crate) fn new(call_id: String, to: Jid, headers: BTreeMap<String, String>) -> Self {
        Self {
            call_id,
            to,
            headers,
        }
    }

    /// Call id.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Address the offer was sent to.
    pub fn to(&self) -> &Jid {
        &self.to
    }

    /// Offer headers.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Look up an offer header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(|s| s.as_str())
    }
}

/// What happened on a call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CallEventKind {
    /// The far end answered.
    Answered,
    /// The far end is ringing.
    Ringing,
    /// The call ended.
    End { reason: Option<String> },
    /// Informational notice.
    Info { name: String },
    /// Anything else, passed through untouched.
    Other(Node),
}

/// An event on an existing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    /// Call the event belongs to.
    pub call_id: String,
    /// Component that raised it, if any.
    pub component_id: Option<String>,
    /// What happened.
    pub kind: CallEventKind,
}

/// A switch-management event.
///
/// Either forwarded to a command as an intermediate notification or, with no
/// `component_id`, published as unsolicited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerEvent {
    name: String,
    component_id: Option<String>,
    attributes: Attributes,
}

impl ManagerEvent {
    /// Build an event.
    pub fn new(name: impl Into<String>, component_id: Option<String>, attributes: Attributes) -> Self {
        Self {
            name: name.into(),
            component_id,
            attributes,
        }
    }

    /// Event name (the `Event:` field).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Component the event was routed to.
    pub fn component_id(&self) -> Option<&str> {
        self.component_id
            .as_deref()
    }

    /// Event fields, keys lower-cased.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

/// Everything delivered on the [`EventStream`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// A link's reader started.
    Connected(Link),
    /// A link's reader stopped.
    Disconnected {
        link: Link,
        reason: DisconnectReason,
    },
    /// A new call was offered.
    Offer(Call),
    /// Something happened on a call.
    Call(CallEvent),
    /// A command or component completed.
    Complete {
        command_id: Option<CommandId>,
        call_id: Option<String>,
        component_id: Option<String>,
        reason: CompletionReason,
    },
    /// Unsolicited switch-management event.
    Manager(ManagerEvent),
}

struct QueueState {
    /// Set when events have been dropped due to a full queue
    overflow: AtomicBool,
    /// Total count of dropped events
    dropped: AtomicU64,
}

/// Sending half of the event stream (Clone + Send).
///
/// Shared by every reader task that publishes events.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Result<Event, CallCtlError>>,
    state: Arc<QueueState>,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("dropped", &self.dropped_event_count())
            .finish()
    }
}

/// Event stream receiver (!Clone)
///
/// Events are delivered as `Result<Event, CallCtlError>`. An
/// `Err(CallCtlError::QueueFull)` indicates that one or more events were
/// dropped because the application fell behind; connection-level failures
/// (protocol violations) are surfaced the same way.
pub struct EventStream {
    rx: mpsc::Receiver<Result<Event, CallCtlError>>,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .finish_non_exhaustive()
    }
}

/// Create a bounded event stream.
pub fn event_channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = EventSink {
        tx,
        state: Arc::new(QueueState {
            overflow: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }),
    };
    (sink, EventStream { rx })
}

impl EventSink {
    /// Publish an event (or error) without waiting.
    ///
    /// If the channel is full, drop the item, set the overflow flag, and
    /// increment the dropped counter. Before each dispatch, check the overflow
    /// flag and attempt to deliver a QueueFull error notification first.
    /// Returns `false` once the application has dropped the stream.
    pub fn dispatch(&self, item: Result<Event, CallCtlError>) -> bool {
        if self
            .state
            .overflow
            .load(Ordering::Relaxed)
        {
            match self
                .tx
                .try_send(Err(CallCtlError::QueueFull))
            {
                Ok(()) => {
                    self.state
                        .overflow
                        .store(false, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }

        match self
            .tx
            .try_send(item)
        {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.state
                    .overflow
                    .store(true, Ordering::Relaxed);
                self.state
                    .dropped
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Event queue full, dropping event");
                true
            }
        }
    }

    /// Publish an event.
    pub fn publish(&self, event: Event) -> bool {
        self.dispatch(Ok(event))
    }

    /// Number of events dropped due to a full event queue.
    pub fn dropped_event_count(&self) -> u64 {
        self.state
            .dropped
            .load(Ordering::Relaxed)
    }

    /// `true` once the receiving side was dropped.
    pub fn is_closed(&self) -> bool {
        self.tx
            .is_closed()
    }
}

impl EventStream {
    /// Receive the next event, or None once every sink is gone.
    ///
    /// Returns `Err(CallCtlError::QueueFull)` if events were dropped because
    /// the application was not draining events fast enough. This is a one-time
    /// notification per overflow episode.
    pub async fn recv(&mut self) -> Option<Result<Event, CallCtlError>> {
        self.rx
            .recv()
            .await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<Result<Event, CallCtlError>> {
        self.rx
            .try_recv()
            .ok()
    }
}

impl futures_util::Stream for EventStream {
    type Item = Result<Event, CallCtlError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}
