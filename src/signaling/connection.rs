//! Connection management for the signaling link

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::{
    command::{Command, CommandPayload, SignalingCommand},
    constants::{DEFAULT_WRITE_TIMEOUT_MS, MAX_EVENT_QUEUE_SIZE, TRANSPORT_ID_PREFIX},
    correlation::CorrelationTable,
    error::{CallCtlError, CallCtlResult, TransportFailure},
    event::{
        event_channel, Call, CallEvent, CallEventKind, ConnectionStatus, DisconnectReason, Event,
        EventSink, EventStream, Link,
    },
    jid::Jid,
    reason::CompletionReason,
    signaling::stanza::{Envelope, InboundStanza, Presence, PresencePayload, ReplyBody},
    transport::SignalingTransport,
};

/// Options for a signaling connection.
///
/// Use [`Default::default()`] for standard settings.
#[derive(Debug, Clone)]
pub struct SignalingOptions {
    /// Capacity of the event stream created by [`SignalingConnection::connect`].
    /// Default: 1000.
    pub event_queue_size: usize,
    /// Default time a write waits for its reply. Default: 3 seconds.
    pub write_timeout: Duration,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
        }
    }
}

/// Shared state between SignalingConnection handles and the reader task
struct SharedState {
    table: CorrelationTable,
    /// Write reply timeout in milliseconds
    write_timeout_ms: AtomicU64,
    /// Source of transport request ids
    next_id: AtomicU64,
}

/// Signaling connection handle (Clone + Send)
///
/// Any number of tasks may call [`write`](Self::write) concurrently; each
/// waits on its own reply slot. A single reader task routes inbound replies
/// to those slots and everything else to the event stream.
#[derive(Clone)]
pub struct SignalingConnection {
    transport: Arc<dyn SignalingTransport>,
    client_jid: Jid,
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for SignalingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingConnection")
            .field("jid", &self.client_jid.to_string())
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn fail_command(command: &Command, details: impl Into<String>) {
    command.settle(CompletionReason::error(details));
}

/// Background reader loop
async fn reader_loop(
    inbound: mpsc::Receiver<InboundStanza>,
    shared: Arc<SharedState>,
    status_tx: watch::Sender<ConnectionStatus>,
    events: EventSink,
) {
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(inbound, &shared, &events));
    let reason = match futures_util::FutureExt::catch_unwind(result).await {
        Ok(reason) => reason,
        Err(_) => {
            tracing::error!("signaling reader task panicked");
            DisconnectReason::ReaderPanicked
        }
    };

    // Wake every blocked writer; their commands get an Error outcome.
    for command in shared
        .table
        .close()
    {
        fail_command(&command, format!("signaling link down: {}", reason));
    }
    let _ = status_tx.send(ConnectionStatus::Disconnected(reason.clone()));
    events.publish(Event::Disconnected {
        link: Link::Signaling,
        reason,
    });
}

async fn reader_loop_inner(
    mut inbound: mpsc::Receiver<InboundStanza>,
    shared: &SharedState,
    events: &EventSink,
) -> DisconnectReason {
    if !events.publish(Event::Connected(Link::Signaling)) {
        return DisconnectReason::EventStreamClosed;
    }

    while let Some(stanza) = inbound
        .recv()
        .await
    {
        trace!("[RECV] {}", stanza.describe());
        match dispatch_inbound(shared, events, stanza) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Event channel closed, signaling reader exiting");
                return DisconnectReason::EventStreamClosed;
            }
            Err(e) => {
                warn!("Signaling link failed: {}", e);
                let reason = match &e {
                    CallCtlError::ProtocolViolation { message } => {
                        DisconnectReason::ProtocolViolation(message.clone())
                    }
                    other => DisconnectReason::ProtocolViolation(other.to_string()),
                };
                events.dispatch(Err(e));
                return reason;
            }
        }
    }

    info!("Signaling inbound stream closed");
    DisconnectReason::InboundClosed
}

/// Route one inbound stanza. `Ok(false)` means the event stream is gone;
/// `Err` is fatal to the connection.
fn dispatch_inbound(
    shared: &SharedState,
    events: &EventSink,
    stanza: InboundStanza,
) -> CallCtlResult<bool> {
    match stanza {
        InboundStanza::Presence(presence) => handle_presence(shared, events, presence),
        InboundStanza::Result { id, from, body } => {
            learn_domain(shared, &from);
            shared
                .table
                .resolve(&id, Ok(body));
            Ok(true)
        }
        InboundStanza::Error { id, from, error } => {
            learn_domain(shared, &from);
            shared
                .table
                .resolve(&id, Err(error));
            Ok(true)
        }
        InboundStanza::Unsupported { description } => Err(CallCtlError::protocol_violation(
            format!("unexpected inbound stanza: {}", description),
        )),
    }
}

fn learn_domain(shared: &SharedState, from: &Jid) {
    if let Some(call_id) = from.node() {
        shared
            .table
            .record_call_domain(call_id, from.domain());
    }
}

fn handle_presence(
    shared: &SharedState,
    events: &EventSink,
    presence: Presence,
) -> CallCtlResult<bool> {
    let Presence { from, to, payload } = presence;
    let call_id = from
        .node()
        .ok_or_else(|| {
            CallCtlError::protocol_violation(format!("presence from {} carries no call id", from))
        })?
        .to_string();
    info!("Receiving event for call ID {}", call_id);
    shared
        .table
        .record_call_domain(&call_id, from.domain());
    let component_id = from
        .resource()
        .map(str::to_string);

    let event = match payload {
        PresencePayload::Offer { headers } => Event::Offer(Call::new(call_id, to, headers)),
        PresencePayload::Complete(reason) => {
            let command = component_id
                .as_deref()
                .and_then(|cid| {
                    shared
                        .table
                        .take_command_for_resource(cid)
                });
            let command_id = command.map(|command| {
                command.settle(reason.clone());
                command
                    .id()
                    .clone()
            });
            if command_id.is_none() {
                debug!(
                    "Completion from {} matches no tracked command",
                    from
                );
            }
            Event::Complete {
                command_id,
                call_id: Some(call_id),
                component_id,
                reason,
            }
        }
        PresencePayload::Answered => call_event(call_id, component_id, CallEventKind::Answered),
        PresencePayload::Ringing => call_event(call_id, component_id, CallEventKind::Ringing),
        PresencePayload::End { reason } => {
            call_event(call_id, component_id, CallEventKind::End { reason })
        }
        PresencePayload::Info { name } => {
            call_event(call_id, component_id, CallEventKind::Info { name })
        }
        PresencePayload::Other(node) => {
            call_event(call_id, component_id, CallEventKind::Other(node))
        }
    };
    Ok(events.publish(event))
}

fn call_event(call_id: String, component_id: Option<String>, kind: CallEventKind) -> Event {
    Event::Call(CallEvent {
        call_id,
        component_id,
        kind,
    })
}

impl SignalingConnection {
    /// Start a connection with its own event stream.
    pub fn connect<T>(
        transport: T,
        inbound: mpsc::Receiver<InboundStanza>,
        client_jid: Jid,
        options: SignalingOptions,
    ) -> (Self, EventStream)
    where
        T: SignalingTransport + 'static,
    {
        let (sink, stream) = event_channel(options.event_queue_size);
        let connection = Self::spawn(Arc::new(transport), inbound, client_jid, options, sink);
        (connection, stream)
    }

    /// Start a connection publishing into an existing event sink.
    pub fn spawn(
        transport: Arc<dyn SignalingTransport>,
        inbound: mpsc::Receiver<InboundStanza>,
        client_jid: Jid,
        options: SignalingOptions,
        events: EventSink,
    ) -> Self {
        let shared = Arc::new(SharedState {
            table: CorrelationTable::new(),
            write_timeout_ms: AtomicU64::new(options.write_timeout.as_millis() as u64),
            next_id: AtomicU64::new(1),
        });

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);

        tokio::spawn(reader_loop(inbound, shared.clone(), status_tx, events));

        info!("Signaling connection started as {}", client_jid);
        SignalingConnection {
            transport,
            client_jid,
            shared,
            status_rx,
        }
    }

    /// Send a command and wait for its reply, using the connection's write
    /// timeout.
    pub async fn write(&self, command: &Command) -> CallCtlResult<ReplyBody> {
        let wait = Duration::from_millis(
            self.shared
                .write_timeout_ms
                .load(Ordering::Relaxed),
        );
        self.write_with_timeout(command, wait)
            .await
    }

    /// Send a command and wait at most `wait` for its reply.
    ///
    /// The command is addressed to the bare service domain if it is
    /// connection-scoped, otherwise to the domain its call was last heard
    /// from; an unknown call fails with [`CallCtlError::Routing`] before
    /// anything is sent. A timeout purges the pending request, so a late
    /// reply is logged and dropped.
    pub async fn write_with_timeout(
        &self,
        command: &Command,
        wait: Duration,
    ) -> CallCtlResult<ReplyBody> {
        let signal = match command.payload() {
            CommandPayload::Signaling(signal) => signal,
            CommandPayload::Action(request) => {
                return Err(CallCtlError::invalid_command(format!(
                    "action {} belongs on the switch-management link",
                    request.name()
                )))
            }
        };
        if !self.is_connected() {
            return Err(CallCtlError::NotConnected);
        }

        let to = self.destination(command, signal)?;
        command.request()?;

        let id = self.next_transport_id();
        let mut slot = match self
            .shared
            .table
            .register(&id)
        {
            Ok(slot) => slot,
            Err(e) => {
                fail_command(command, e.to_string());
                return Err(e);
            }
        };
        self.shared
            .table
            .track_command(&id, command.clone());

        let envelope = Envelope::set(&id, to, signal);
        debug!("[WRITE] Sending {}", envelope);
        if let Err(failure) = self
            .transport
            .send(envelope)
            .await
        {
            warn!("[WRITE] Send of {} failed: {}", id, failure);
            self.shared
                .table
                .cancel(&id);
            fail_command(command, failure.to_string());
            return Err(CallCtlError::Transport(failure));
        }

        let timeout_ms = wait.as_millis() as u64;
        let reply = match timeout(wait, &mut slot).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                fail_command(command, "signaling link closed");
                return Err(CallCtlError::ConnectionClosed);
            }
            Err(_) => {
                if self
                    .shared
                    .table
                    .cancel(&id)
                {
                    warn!("[WRITE] No reply to {} within {}ms", id, timeout_ms);
                    fail_command(command, format!("no reply within {}ms", timeout_ms));
                    return Err(CallCtlError::Timeout { timeout_ms });
                }
                // The reader claimed the slot as the timer fired and is
                // about to fill it.
                match slot.await {
                    Ok(reply) => reply,
                    Err(_) => {
                        fail_command(command, "signaling link closed");
                        return Err(CallCtlError::ConnectionClosed);
                    }
                }
            }
        };

        match reply {
            Ok(body) => {
                debug!("[WRITE] {} acknowledged", id);
                Ok(body)
            }
            Err(error) => Err(CallCtlError::Transport(TransportFailure::from(error))),
        }
    }

    fn destination(&self, command: &Command, signal: &SignalingCommand) -> CallCtlResult<Jid> {
        if signal
            .kind()
            .is_connection_scoped()
        {
            return Ok(Jid::domain_only(self.client_jid.domain()));
        }
        let call_id = command
            .call_id()
            .ok_or_else(|| {
                CallCtlError::invalid_command(format!("{} requires a target call", signal.kind()))
            })?;
        let domain = self
            .shared
            .table
            .domain_for(call_id)
            .ok_or_else(|| CallCtlError::Routing {
                call_id: call_id.to_string(),
            })?;
        Ok(Jid::new(Some(call_id), domain, signal.component_id()))
    }

    fn next_transport_id(&self) -> String {
        let n = self
            .shared
            .next_id
            .fetch_add(1, Ordering::Relaxed);
        format!("{}-{:04}", TRANSPORT_ID_PREFIX, n)
    }

    /// Command that created a resource, via `resource id → transport id →
    /// command`.
    pub fn original_command_for(&self, resource_id: &str) -> Option<Command> {
        self.shared
            .table
            .original_command_for(resource_id)
    }

    /// Domain a call was last heard from.
    pub fn domain_for(&self, call_id: &str) -> Option<String> {
        self.shared
            .table
            .domain_for(call_id)
    }

    /// Forget a call's routing entry once the caller is done with it.
    pub fn forget_call(&self, call_id: &str) {
        self.shared
            .table
            .remove_call(call_id);
    }

    /// Number of writes waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared
            .table
            .pending_count()
    }

    /// Set the default write timeout (default: 3 seconds).
    pub fn set_write_timeout(&self, duration: Duration) {
        self.shared
            .write_timeout_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current default write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(
            self.shared
                .write_timeout_ms
                .load(Ordering::Relaxed),
        )
    }

    /// Address this connection signs in as.
    pub fn client_jid(&self) -> &Jid {
        &self.client_jid
    }

    /// Whether the reader task is alive.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            ConnectionStatus::Connected
        )
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx
            .borrow()
            .clone()
    }

    /// Wait until the reader task has stopped, returning why.
    pub async fn closed(&self) -> DisconnectReason {
        let mut rx = self
            .status_rx
            .clone();
        loop {
            if let ConnectionStatus::Disconnected(reason) = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx
                .changed()
                .await
                .is_err()
            {
                return DisconnectReason::InboundClosed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, CommandState, Reference};
    use crate::node::Node;
    use crate::signaling::StanzaError;
    use crate::transport::memory::{signaling_link, SignalingPeer};

    fn start(
        write_timeout: Duration,
    ) -> (SignalingConnection, EventStream, SignalingPeer) {
        let (transport, inbound, peer) = signaling_link(16);
        let options = SignalingOptions {
            write_timeout,
            ..Default::default()
        };
        let (conn, events) = SignalingConnection::connect(
            transport,
            inbound,
            "usera@127.0.0.1/voxeo"
                .parse()
                .unwrap(),
            options,
        );
        (conn, events, peer)
    }

    fn presence(from: &str, payload: PresencePayload) -> InboundStanza {
        InboundStanza::Presence(Presence {
            from: from
                .parse()
                .unwrap(),
            to: "usera@127.0.0.1/voxeo"
                .parse()
                .unwrap(),
            payload,
        })
    }

    async fn next_event(events: &mut EventStream) -> Event {
        timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream closed")
            .expect("error item")
    }

    async fn learn_call(peer: &SignalingPeer, events: &mut EventStream, call_id: &str) {
        peer.deliver(presence(
            &format!("{}@calls.example.com", call_id),
            PresencePayload::Ringing,
        ))
        .await;
        loop {
            if let Event::Call(_) = next_event(events).await {
                break;
            }
        }
    }

    #[tokio::test]
    async fn publishes_connected_first() {
        let (_conn, mut events, _peer) = start(Duration::from_secs(1));
        assert_eq!(
            next_event(&mut events).await,
            Event::Connected(Link::Signaling)
        );
    }

    #[tokio::test]
    async fn unknown_call_fails_with_routing_error_before_send() {
        let (conn, _events, mut peer) = start(Duration::from_secs(1));
        let cmd = Command::call("c1", SignalingCommand::new(CommandKind::Answer));
        let err = conn
            .write(&cmd)
            .await
            .unwrap_err();
        assert!(matches!(err, CallCtlError::Routing { ref call_id } if call_id == "c1"));
        assert!(peer
            .try_next_sent()
            .is_none());
        assert_eq!(cmd.state(), CommandState::Created);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn dial_goes_to_bare_domain() {
        let (conn, _events, mut peer) = start(Duration::from_secs(1));
        let cmd = Command::connection(SignalingCommand::new(CommandKind::Dial));
        let writer = {
            let conn = conn.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move { conn.write(&cmd).await })
        };
        let env = peer
            .next_sent()
            .await
            .unwrap();
        assert_eq!(env.to, Jid::domain_only("127.0.0.1"));
        peer.deliver(InboundStanza::Result {
            id: env.id,
            from: Jid::domain_only("127.0.0.1"),
            body: ReplyBody::Ref(Reference::new("new-call-id")),
        })
        .await;
        let body = writer
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            body.reference()
                .map(Reference::id),
            Some("new-call-id")
        );
        // Dial does not start a component: the reference is the new call,
        // and the command is done.
        assert_eq!(cmd.state(), CommandState::Complete);
        assert_eq!(
            cmd.reference()
                .map(|r| r.id().to_string()),
            Some("new-call-id".to_string())
        );
        assert!(cmd
            .completion()
            .unwrap()
            .is_success());
        assert!(conn
            .original_command_for("new-call-id")
            .is_none());
    }

    #[tokio::test]
    async fn write_resolves_with_result_and_completes_simple_command() {
        let (conn, mut events, mut peer) = start(Duration::from_secs(1));
        learn_call(&peer, &mut events, "c1").await;

        let cmd = Command::call("c1", SignalingCommand::new(CommandKind::Answer));
        let writer = {
            let conn = conn.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move { conn.write(&cmd).await })
        };
        let env = peer
            .next_sent()
            .await
            .unwrap();
        assert_eq!(env.to.to_string(), "c1@calls.example.com");
        peer.deliver(InboundStanza::Result {
            id: env.id,
            from: "c1@calls.example.com"
                .parse()
                .unwrap(),
            body: ReplyBody::Empty,
        })
        .await;

        assert_eq!(
            writer
                .await
                .unwrap()
                .unwrap(),
            ReplyBody::Empty
        );
        assert!(cmd
            .completion()
            .unwrap()
            .is_success());
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_reply_fails_write_with_original_payload() {
        let (conn, mut events, mut peer) = start(Duration::from_secs(1));
        learn_call(&peer, &mut events, "c1").await;

        let cmd = Command::call("c1", SignalingCommand::new(CommandKind::Answer));
        let writer = {
            let conn = conn.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move { conn.write(&cmd).await })
        };
        let env = peer
            .next_sent()
            .await
            .unwrap();
        peer.deliver(InboundStanza::Error {
            id: env.id,
            from: "c1@calls.example.com"
                .parse()
                .unwrap(),
            error: StanzaError::new("cancel", "item-not-found").with_payload(env.payload),
        })
        .await;

        match writer
            .await
            .unwrap()
        {
            Err(CallCtlError::Transport(failure)) => {
                assert_eq!(failure.condition.as_deref(), Some("item-not-found"));
                assert_eq!(
                    failure
                        .payload
                        .as_ref()
                        .map(Node::name),
                    Some("answer")
                );
            }
            other => panic!("expected transport error, got {:?}", other),
        }
        assert_eq!(
            cmd.completion()
                .unwrap()
                .details(),
            Some("cancel: item-not-found")
        );
    }

    #[tokio::test]
    async fn timeout_purges_pending_and_late_reply_is_dropped() {
        let (conn, mut events, mut peer) = start(Duration::from_millis(50));
        learn_call(&peer, &mut events, "c1").await;

        let cmd = Command::call("c1", SignalingCommand::new(CommandKind::Hangup));
        let started = tokio::time::Instant::now();
        let err = conn
            .write(&cmd)
            .await
            .unwrap_err();
        assert!(matches!(err, CallCtlError::Timeout { timeout_ms: 50 }));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(conn.pending_count(), 0);
        assert!(!cmd
            .completion()
            .unwrap()
            .is_success());

        let env = peer
            .next_sent()
            .await
            .unwrap();
        peer.deliver(InboundStanza::Result {
            id: env.id,
            from: "c1@calls.example.com"
                .parse()
                .unwrap(),
            body: ReplyBody::Empty,
        })
        .await;
        // Still connected, outcome unchanged.
        peer.deliver(presence("c1@calls.example.com", PresencePayload::Answered))
            .await;
        loop {
            if let Event::Call(_) = next_event(&mut events).await {
                break;
            }
        }
        assert!(conn.is_connected());
        assert!(!cmd
            .completion()
            .unwrap()
            .is_success());
    }

    #[tokio::test]
    async fn late_reference_reply_leaves_no_resource_mapping() {
        let (conn, mut events, mut peer) = start(Duration::from_millis(50));
        learn_call(&peer, &mut events, "c1").await;

        let cmd = Command::call("c1", SignalingCommand::new(CommandKind::Input));
        let err = conn
            .write(&cmd)
            .await
            .unwrap_err();
        assert!(matches!(err, CallCtlError::Timeout { timeout_ms: 50 }));

        let env = peer
            .next_sent()
            .await
            .unwrap();
        peer.deliver(InboundStanza::Result {
            id: env.id,
            from: "c1@calls.example.com"
                .parse()
                .unwrap(),
            body: ReplyBody::Ref(Reference::new("input-1")),
        })
        .await;
        peer.deliver(presence("c1@calls.example.com", PresencePayload::Ringing))
            .await;
        loop {
            if let Event::Call(_) = next_event(&mut events).await {
                break;
            }
        }

        assert!(conn
            .original_command_for("input-1")
            .is_none());
        assert_eq!(cmd.state(), CommandState::Complete);
        assert!(cmd
            .reference()
            .is_none());
        assert!(!cmd
            .completion()
            .unwrap()
            .is_success());
    }

    #[tokio::test]
    async fn send_failure_is_a_transport_error() {
        let (conn, mut events, peer) = start(Duration::from_secs(1));
        learn_call(&peer, &mut events, "c1").await;
        peer.set_refusing(true);

        let cmd = Command::call("c1", SignalingCommand::new(CommandKind::Answer));
        let err = conn
            .write(&cmd)
            .await
            .unwrap_err();
        assert!(matches!(err, CallCtlError::Transport(_)));
        assert_eq!(conn.pending_count(), 0);
        assert!(cmd.is_complete());
    }

    #[tokio::test]
    async fn offer_publishes_call() {
        let (conn, mut events, peer) = start(Duration::from_secs(1));
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("x-caller".to_string(), "sip:alice@example.com".to_string());
        peer.deliver(presence(
            "9f00061@calls.example.com",
            PresencePayload::Offer { headers },
        ))
        .await;

        let call = loop {
            if let Event::Offer(call) = next_event(&mut events).await {
                break call;
            }
        };
        assert_eq!(call.call_id(), "9f00061");
        assert_eq!(call.header("x-caller"), Some("sip:alice@example.com"));
        assert_eq!(
            conn.domain_for("9f00061")
                .as_deref(),
            Some("calls.example.com")
        );
    }

    #[tokio::test]
    async fn component_completion_reaches_its_command() {
        let (conn, mut events, mut peer) = start(Duration::from_secs(1));
        learn_call(&peer, &mut events, "c1").await;

        let cmd = Command::call("c1", SignalingCommand::new(CommandKind::Input));
        let writer = {
            let conn = conn.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move { conn.write(&cmd).await })
        };
        let env = peer
            .next_sent()
            .await
            .unwrap();
        peer.deliver(InboundStanza::Result {
            id: env.id,
            from: "c1@calls.example.com"
                .parse()
                .unwrap(),
            body: ReplyBody::Ref(Reference::new("comp-1")),
        })
        .await;
        writer
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd.state(), CommandState::Executing);

        peer.deliver(presence(
            "c1@calls.example.com/comp-1",
            PresencePayload::Complete(CompletionReason::NoMatch),
        ))
        .await;
        let event = loop {
            let event = next_event(&mut events).await;
            if matches!(event, Event::Complete { .. }) {
                break event;
            }
        };
        match event {
            Event::Complete {
                command_id,
                component_id,
                reason,
                ..
            } => {
                assert_eq!(command_id.as_ref(), Some(cmd.id()));
                assert_eq!(component_id.as_deref(), Some("comp-1"));
                assert_eq!(reason, CompletionReason::NoMatch);
            }
            _ => unreachable!(),
        }
        assert_eq!(cmd.completion(), Some(CompletionReason::NoMatch));
        assert!(conn
            .original_command_for("comp-1")
            .is_none());
    }

    #[tokio::test]
    async fn component_command_addresses_resource() {
        let (conn, mut events, mut peer) = start(Duration::from_millis(50));
        learn_call(&peer, &mut events, "c1").await;
        let cmd = Command::call(
            "c1",
            SignalingCommand::new(CommandKind::Stop).for_component("comp-1"),
        );
        let _ = conn
            .write(&cmd)
            .await;
        let env = peer
            .next_sent()
            .await
            .unwrap();
        assert_eq!(env.to.to_string(), "c1@calls.example.com/comp-1");
    }

    #[tokio::test]
    async fn unsupported_stanza_fails_connection_and_pending_writes() {
        let (conn, mut events, mut peer) = start(Duration::from_secs(5));
        learn_call(&peer, &mut events, "c1").await;

        let cmd = Command::call("c1", SignalingCommand::new(CommandKind::Answer));
        let writer = {
            let conn = conn.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move { conn.write(&cmd).await })
        };
        peer.next_sent()
            .await
            .unwrap();
        peer.deliver(InboundStanza::Unsupported {
            description: "iq get".into(),
        })
        .await;

        assert!(matches!(
            writer
                .await
                .unwrap(),
            Err(CallCtlError::ConnectionClosed)
        ));
        assert!(matches!(
            events.recv().await,
            Some(Err(CallCtlError::ProtocolViolation { .. }))
        ));
        assert!(matches!(
            next_event(&mut events).await,
            Event::Disconnected {
                link: Link::Signaling,
                reason: DisconnectReason::ProtocolViolation(_)
            }
        ));
        assert!(!conn.is_connected());
        assert!(cmd.is_complete());

        let again = Command::call("c1", SignalingCommand::new(CommandKind::Answer));
        assert!(matches!(
            conn.write(&again).await,
            Err(CallCtlError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn actions_are_rejected() {
        let (conn, _events, _peer) = start(Duration::from_secs(1));
        let cmd = Command::action(crate::command::ActionRequest::new("Ping"));
        assert!(matches!(
            conn.write(&cmd).await,
            Err(CallCtlError::InvalidCommand { .. })
        ));
    }

    #[tokio::test]
    async fn write_timeout_is_adjustable() {
        let (conn, _events, _peer) = start(Duration::from_secs(3));
        assert_eq!(conn.write_timeout(), Duration::from_secs(3));
        conn.set_write_timeout(Duration::from_millis(250));
        assert_eq!(conn.write_timeout(), Duration::from_millis(250));
    }
}
