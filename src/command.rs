//! Commands issued by application code and their lifecycle

use crate::{
    constants::CALL_CONTROL_NAMESPACE,
    error::{CallCtlError, CallCtlResult},
    event::ManagerEvent,
    node::Node,
    reason::CompletionReason,
    signaling::ReplyBody,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

/// Unique identifier of a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(String);

impl CommandId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        CommandId(
            Uuid::new_v4()
                .to_string(),
        )
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

define_parse_error!(
    /// Error returned when parsing an unknown command state.
    ParseCommandStateError,
    "command state"
);

define_wire_enum! {
    error_type: ParseCommandStateError,
    /// Lifecycle of a command: `created → requested → executing → complete`.
    pub enum CommandState {
        Created => "created",
        Requested => "requested",
        Executing => "executing",
        Complete => "complete",
    }
}

define_parse_error!(
    /// Error returned when parsing an unknown command kind.
    ParseCommandKindError,
    "command kind"
);

define_wire_enum! {
    error_type: ParseCommandKindError,
    /// Call-control command kinds understood by the signaling endpoint.
    pub enum CommandKind {
        Dial => "dial",
        Answer => "answer",
        Accept => "accept",
        Hangup => "hangup",
        Reject => "reject",
        Redirect => "redirect",
        Mute => "mute",
        Unmute => "unmute",
        Hold => "hold",
        Unhold => "unhold",
        Join => "join",
        Unjoin => "unjoin",
        Say => "say",
        Output => "output",
        Input => "input",
        Record => "record",
        Stop => "stop",
    }
}

impl CommandKind {
    /// Connection-scoped commands go to the bare service domain rather than
    /// to a call.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, CommandKind::Dial)
    }

    /// Commands that start a component and are answered with a reference.
    pub fn starts_component(&self) -> bool {
        matches!(
            self,
            CommandKind::Say | CommandKind::Output | CommandKind::Input | CommandKind::Record
        )
    }
}

/// A command for the signaling endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingCommand {
    kind: CommandKind,
    node: Node,
    headers: BTreeMap<String, String>,
    component_id: Option<String>,
}

impl SignalingCommand {
    /// Command with an empty payload element named after its kind.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            node: Node::new(kind.as_str()).with_namespace(CALL_CONTROL_NAMESPACE),
            headers: BTreeMap::new(),
            component_id: None,
        }
    }

    /// Replace the payload element.
    pub fn with_node(mut self, node: Node) -> Self {
        self.node = node;
        self
    }

    /// Attach a header (e.g. a SIP header on `answer` or `hangup`).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into(), value.into());
        self
    }

    /// Address a running component instead of the call itself.
    pub fn for_component(mut self, component_id: impl Into<String>) -> Self {
        self.component_id = Some(component_id.into());
        self
    }

    /// Command kind.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Payload element.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Attached headers.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Targeted component, if any.
    pub fn component_id(&self) -> Option<&str> {
        self.component_id
            .as_deref()
    }
}

/// A switch-management action request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    name: String,
    params: BTreeMap<String, String>,
}

impl ActionRequest {
    /// Action with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .insert(key.into(), value.into());
        self
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters, as given by the application.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

/// Which transport a command is for, with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    /// Sent to the signaling endpoint.
    Signaling(SignalingCommand),
    /// Sent to the switch-management endpoint.
    Action(ActionRequest),
}

/// Reference to a resource created by a command (e.g. a running component).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    id: String,
}

impl Reference {
    /// Reference with the given resource id.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Resource id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

type IntermediateHandler = Arc<dyn Fn(&ManagerEvent) + Send + Sync>;

struct Lifecycle {
    state: CommandState,
    reference: Option<Reference>,
}

struct CommandInner {
    id: CommandId,
    call_id: Option<String>,
    payload: CommandPayload,
    lifecycle: Mutex<Lifecycle>,
    completion: watch::Sender<Option<CompletionReason>>,
    handlers: Mutex<Vec<IntermediateHandler>>,
}

/// An application-issued request (Clone + Send + Sync).
///
/// Clones share state. Lifecycle transitions are driven by the correlation
/// layer only; application code observes them.
#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.inner.id)
            .field("call_id", &self.inner.call_id)
            .field("state", &self.state())
            .field("payload", &self.inner.payload)
            .finish()
    }
}

impl Command {
    fn build(call_id: Option<String>, payload: CommandPayload) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            inner: Arc::new(CommandInner {
                id: CommandId::generate(),
                call_id,
                payload,
                lifecycle: Mutex::new(Lifecycle {
                    state: CommandState::Created,
                    reference: None,
                }),
                completion,
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Signaling command targeting a call.
    pub fn call(call_id: impl Into<String>, command: SignalingCommand) -> Self {
        Self::build(Some(call_id.into()), CommandPayload::Signaling(command))
    }

    /// Signaling command with no target call (e.g. `dial`).
    pub fn connection(command: SignalingCommand) -> Self {
        Self::build(None, CommandPayload::Signaling(command))
    }

    /// Switch-management action.
    pub fn action(request: ActionRequest) -> Self {
        Self::build(None, CommandPayload::Action(request))
    }

    /// Switch-management action on behalf of a call.
    pub fn call_action(call_id: impl Into<String>, request: ActionRequest) -> Self {
        Self::build(Some(call_id.into()), CommandPayload::Action(request))
    }

    /// Unique identifier.
    pub fn id(&self) -> &CommandId {
        &self.inner.id
    }

    /// Target call, `None` for connection-scoped commands.
    pub fn call_id(&self) -> Option<&str> {
        self.inner
            .call_id
            .as_deref()
    }

    /// Payload.
    pub fn payload(&self) -> &CommandPayload {
        &self.inner.payload
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CommandState {
        self.inner
            .lifecycle
            .lock()
            .state
    }

    /// Resource reference assigned once the command started executing.
    pub fn reference(&self) -> Option<Reference> {
        self.inner
            .lifecycle
            .lock()
            .reference
            .clone()
    }

    /// `true` once an outcome is attached.
    pub fn is_complete(&self) -> bool {
        self.state() == CommandState::Complete
    }

    /// Whether a reference reply leaves this command running a component
    /// that completes later.
    pub fn starts_component(&self) -> bool {
        match &self.inner.payload {
            CommandPayload::Signaling(signal) => signal
                .kind()
                .starts_component(),
            CommandPayload::Action(_) => false,
        }
    }

    /// The outcome, if complete.
    pub fn completion(&self) -> Option<CompletionReason> {
        self.inner
            .completion
            .borrow()
            .clone()
    }

    /// Register a callback for intermediate notifications (causal actions).
    ///
    /// Callbacks run on the reader task; keep them short.
    pub fn on_intermediate_event<F>(&self, handler: F)
    where
        F: Fn(&ManagerEvent) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .push(Arc::new(handler));
    }

    /// Wait for the completion outcome, at most `wait`.
    pub async fn await_completion(&self, wait: Duration) -> CallCtlResult<CompletionReason> {
        let mut rx = self
            .inner
            .completion
            .subscribe();
        let outcome = match timeout(wait, rx.wait_for(Option::is_some)).await {
            Ok(Ok(reason)) => reason
                .clone()
                .ok_or(CallCtlError::ConnectionClosed),
            Ok(Err(_)) => Err(CallCtlError::ConnectionClosed),
            Err(_) => Err(CallCtlError::Timeout {
                timeout_ms: wait.as_millis() as u64,
            }),
        };
        outcome
    }

    /// `created → requested`. A command can be submitted once.
    pub(crate) fn request(&self) -> CallCtlResult<()> {
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock();
        if lifecycle.state != CommandState::Created {
            return Err(CallCtlError::invalid_command(format!(
                "command {} was already submitted ({})",
                self.inner.id, lifecycle.state
            )));
        }
        lifecycle.state = CommandState::Requested;
        Ok(())
    }

    /// `→ executing`, recording the resource reference. No-op once complete.
    pub(crate) fn execute(&self, reference: Option<Reference>) {
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock();
        if lifecycle.state == CommandState::Complete {
            return;
        }
        lifecycle.state = CommandState::Executing;
        if reference.is_some() {
            lifecycle.reference = reference;
        }
    }

    /// Attach the single completion outcome.
    ///
    /// A second attempt is rejected with [`CallCtlError::AlreadyComplete`]
    /// and leaves the first outcome in place.
    pub(crate) fn complete(&self, reason: CompletionReason) -> CallCtlResult<()> {
        {
            let mut lifecycle = self
                .inner
                .lifecycle
                .lock();
            if lifecycle.state == CommandState::Complete {
                return Err(CallCtlError::AlreadyComplete {
                    command_id: self
                        .inner
                        .id
                        .to_string(),
                });
            }
            lifecycle.state = CommandState::Complete;
        }
        debug!("Command {} complete: {}", self.inner.id, reason.name());
        self.inner
            .completion
            .send_replace(Some(reason));
        Ok(())
    }

    /// Complete, logging instead of failing if an outcome is already set.
    pub(crate) fn settle(&self, reason: CompletionReason) {
        if let Err(e) = self.complete(reason) {
            debug!("Ignoring second completion: {}", e);
        }
    }

    /// Forward an intermediate notification to registered handlers.
    pub(crate) fn notify_intermediate(&self, event: &ManagerEvent) {
        let handlers: Vec<IntermediateHandler> = self
            .inner
            .handlers
            .lock()
            .clone();
        if handlers.is_empty() {
            debug!(
                "Command {} has no intermediate handler for {}",
                self.inner.id,
                event.name()
            );
        }
        for handler in handlers {
            handler(event);
        }
    }
}

/// Handle returned by [`Client::submit`](crate::Client::submit).
#[derive(Debug, Clone)]
pub struct CommandHandle {
    command: Command,
    reply: ReplyBody,
}

impl CommandHandle {
    pub(crate) fn new(command: Command, reply: ReplyBody) -> Self {
        Self { command, reply }
    }

    /// The submitted command.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// What the link answered at submission: the result payload of a
    /// signaling write, or [`ReplyBody::Ref`] with the reference an action
    /// was dispatched under.
    pub fn reply(&self) -> &ReplyBody {
        &self.reply
    }

    /// See [`Command::await_completion`].
    pub async fn await_completion(&self, wait: Duration) -> CallCtlResult<CompletionReason> {
        self.command
            .await_completion(wait)
            .await
    }

    /// See [`Command::on_intermediate_event`].
    pub fn on_intermediate_event<F>(&self, handler: F)
    where
        F: Fn(&ManagerEvent) + Send + Sync + 'static,
    {
        self.command
            .on_intermediate_event(handler)
    }
}
