//! Dispatch of actions over the switch-management link

use super::action::{causal_terminator, ActionExecution, Step};
use super::message::{ManagerAction, ManagerMessage, MessageKind};
use crate::{
    command::{Command, CommandPayload, Reference},
    constants::MAX_UNCLAIMED_MESSAGES,
    error::{CallCtlError, CallCtlResult},
    event::{ConnectionStatus, DisconnectReason, Event, EventSink, Link, ManagerEvent},
    reason::CompletionReason,
    transport::ManagerTransport,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Options for a translator.
#[derive(Debug, Clone, Default)]
pub struct TranslatorOptions {
    /// Additional `(action, terminator event)` pairs treated as causal.
    pub extra_causal_actions: Vec<(String, String)>,
}

/// Live executions plus the messages nobody has claimed yet.
#[derive(Default)]
struct Executions {
    /// correlation id → live execution
    live: HashMap<String, ActionExecution>,
    /// Dispatches whose transport has not yet reported a correlation id.
    in_flight: usize,
    /// Correlated messages that matched no live execution while a dispatch
    /// was in flight, oldest first.
    unclaimed: VecDeque<ManagerMessage>,
}

impl Executions {
    /// Feed `message` to the execution keyed by `action_id`, retiring it
    /// once it completes.
    fn step(&mut self, action_id: &str, message: &ManagerMessage) -> Option<Effect> {
        let execution = self
            .live
            .get_mut(action_id)?;
        let step = execution.handle(message);
        let effect = Effect {
            command: execution
                .command()
                .clone(),
            component_id: execution
                .component_id()
                .to_string(),
            step,
        };
        if matches!(effect.step, Step::Complete(_)) {
            self.live
                .remove(action_id);
        }
        Some(effect)
    }

    /// Hold a message whose execution may be about to be re-keyed.
    fn hold(&mut self, message: ManagerMessage) {
        if self
            .unclaimed
            .len()
            >= MAX_UNCLAIMED_MESSAGES
        {
            if let Some(oldest) = self
                .unclaimed
                .pop_front()
            {
                warn!(
                    "[ACTION] Unclaimed buffer full, dropping {} for {}",
                    oldest.kind(),
                    oldest
                        .action_id()
                        .unwrap_or("-")
                );
            }
        }
        self.unclaimed
            .push_back(message);
    }

    /// Move `execution` under the transport's id and replay anything that
    /// arrived for that id first.
    fn rekey(&mut self, mut execution: ActionExecution, correlation_id: &str) -> Vec<Effect> {
        execution.set_action_id(correlation_id);
        self.live
            .insert(correlation_id.to_string(), execution);
        let (claimed, rest): (VecDeque<_>, VecDeque<_>) = self
            .unclaimed
            .drain(..)
            .partition(|m| m.action_id() == Some(correlation_id));
        self.unclaimed = rest;

        let mut effects = Vec::new();
        for message in claimed {
            debug!(
                "[ACTION] Replaying early {} for {}",
                message.kind(),
                correlation_id
            );
            match self.step(correlation_id, &message) {
                Some(effect) => effects.push(effect),
                None => debug!(
                    "[ACTION] {} for finished action {}, dropping",
                    message.kind(),
                    correlation_id
                ),
            }
        }
        effects
    }

    /// A dispatch learned its correlation id or gave up.
    fn settle_in_flight(&mut self) {
        self.in_flight = self
            .in_flight
            .saturating_sub(1);
        if self.in_flight == 0 && !self.unclaimed.is_empty() {
            debug!(
                "[ACTION] Dropping {} messages for unknown or finished actions",
                self.unclaimed
                    .len()
            );
            self.unclaimed
                .clear();
        }
    }
}

/// What the reader does with a routed message once the lock is released.
struct Effect {
    step: Step,
    command: Command,
    component_id: String,
}

struct SharedState {
    executions: Mutex<Executions>,
    options: TranslatorOptions,
    events: EventSink,
}

impl SharedState {
    /// Attach an outcome and broadcast it.
    fn emit(&self, command: &Command, component_id: &str, reason: CompletionReason) {
        command.settle(reason.clone());
        self.events
            .publish(Event::Complete {
                command_id: Some(
                    command
                        .id()
                        .clone(),
                ),
                call_id: command
                    .call_id()
                    .map(str::to_string),
                component_id: Some(component_id.to_string()),
                reason,
            });
    }

    /// Run an effect decided under the executions lock. Handlers and
    /// publishing never run while the lock is held.
    fn apply(&self, effect: Effect) {
        match effect.step {
            Step::Intermediate(event) => effect
                .command
                .notify_intermediate(&event),
            Step::Complete(reason) => self.emit(&effect.command, &effect.component_id, reason),
            Step::Ignored | Step::Pending => {}
        }
    }
}

/// Switch-management translator handle (Clone + Send)
///
/// [`dispatch`](Self::dispatch) returns as soon as the action is on the
/// wire; the outcome reaches the command later, from the reader task.
#[derive(Clone)]
pub struct Translator {
    transport: Arc<dyn ManagerTransport>,
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("connected", &self.is_connected())
            .field("live_actions", &self.live_action_count())
            .finish()
    }
}

async fn reader_loop(
    inbound: mpsc::Receiver<ManagerMessage>,
    shared: Arc<SharedState>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(inbound, &shared));
    let reason = match futures_util::FutureExt::catch_unwind(result).await {
        Ok(reason) => reason,
        Err(_) => {
            tracing::error!("manager reader task panicked");
            DisconnectReason::ReaderPanicked
        }
    };

    let orphans: Vec<ActionExecution> = {
        let mut executions = shared
            .executions
            .lock();
        executions
            .unclaimed
            .clear();
        executions
            .live
            .drain()
            .map(|(_, execution)| execution)
            .collect()
    };
    for mut execution in orphans {
        if let Some(outcome) = execution.fail(format!("manager link down: {}", reason)) {
            shared.emit(execution.command(), execution.component_id(), outcome);
        }
    }
    let _ = status_tx.send(ConnectionStatus::Disconnected(reason.clone()));
    shared
        .events
        .publish(Event::Disconnected {
            link: Link::Manager,
            reason,
        });
}

async fn reader_loop_inner(
    mut inbound: mpsc::Receiver<ManagerMessage>,
    shared: &SharedState,
) -> DisconnectReason {
    if !shared
        .events
        .publish(Event::Connected(Link::Manager))
    {
        return DisconnectReason::EventStreamClosed;
    }

    while let Some(message) = inbound
        .recv()
        .await
    {
        trace!(
            "[RECV] {} {}",
            message.kind(),
            message
                .action_id()
                .unwrap_or("-")
        );
        if !route(shared, message) {
            debug!("Event channel closed, manager reader exiting");
            return DisconnectReason::EventStreamClosed;
        }
    }

    info!("Manager inbound stream closed");
    DisconnectReason::InboundClosed
}

/// Route one inbound message by correlation id. Returns `false` once the
/// event stream is gone.
fn route(shared: &SharedState, message: ManagerMessage) -> bool {
    let Some(action_id) = message.action_id() else {
        return match message.kind() {
            MessageKind::Event => {
                let name = message
                    .name()
                    .unwrap_or_default()
                    .to_string();
                shared
                    .events
                    .publish(Event::Manager(ManagerEvent::new(
                        name,
                        None,
                        message.attributes(),
                    )))
            }
            kind => {
                debug!("Dropping uncorrelated {}", kind);
                true
            }
        };
    };

    let effect = {
        let mut executions = shared
            .executions
            .lock();
        match executions.step(action_id, &message) {
            Some(effect) => effect,
            None if executions.in_flight > 0 => {
                trace!(
                    "[ACTION] Holding {} for {} until dispatch settles",
                    message.kind(),
                    action_id
                );
                executions.hold(message);
                return true;
            }
            None => {
                debug!(
                    "[ACTION] {} for unknown or finished action {}, dropping",
                    message.kind(),
                    action_id
                );
                return true;
            }
        }
    };

    shared.apply(effect);
    !shared
        .events
        .is_closed()
}

impl Translator {
    /// Start a translator publishing into `events`.
    pub fn spawn(
        transport: Arc<dyn ManagerTransport>,
        inbound: mpsc::Receiver<ManagerMessage>,
        events: EventSink,
        options: TranslatorOptions,
    ) -> Self {
        let shared = Arc::new(SharedState {
            executions: Mutex::new(Executions::default()),
            options,
            events,
        });
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);

        tokio::spawn(reader_loop(inbound, shared.clone(), status_tx));

        info!("Manager translator started");
        Translator {
            transport,
            shared,
            status_rx,
        }
    }

    /// Send the command's action and return the reference assigned to it.
    ///
    /// Does not wait for the outcome. A send failure completes the command
    /// with an `Error` outcome rather than failing the call, so observers
    /// always see exactly one completion.
    pub async fn dispatch(&self, command: &Command) -> CallCtlResult<Reference> {
        let request = match command.payload() {
            CommandPayload::Action(request) => request,
            CommandPayload::Signaling(signal) => {
                return Err(CallCtlError::invalid_command(format!(
                    "{} belongs on the signaling link",
                    signal.kind()
                )))
            }
        };
        if !self.is_connected() {
            return Err(CallCtlError::NotConnected);
        }
        command.request()?;

        let action_id = Uuid::new_v4().to_string();
        let component_id = Uuid::new_v4().to_string();
        let reference = Reference::new(&component_id);
        command.execute(Some(reference.clone()));

        let terminator = causal_terminator(
            request.name(),
            &self
                .shared
                .options
                .extra_causal_actions,
        );
        let mut execution =
            ActionExecution::new(command.clone(), &action_id, &component_id, terminator);
        execution.sent();
        // Registered before the send so a fast reply always finds it. Until
        // the transport reports its correlation id, replies under another id
        // are held rather than dropped.
        {
            let mut executions = self
                .shared
                .executions
                .lock();
            executions
                .live
                .insert(action_id.clone(), execution);
            executions.in_flight += 1;
        }

        let action = ManagerAction::from_request(request, &action_id);
        debug!("[ACTION] Sending {} as {}", request.name(), action_id);
        let sent = self
            .transport
            .send_action(action)
            .await;

        let effects = {
            let mut executions = self
                .shared
                .executions
                .lock();
            let effects = match &sent {
                Ok(correlation_id) if *correlation_id != action_id => {
                    debug!(
                        "[ACTION] Transport correlates {} as {}",
                        action_id, correlation_id
                    );
                    match executions
                        .live
                        .remove(&action_id)
                    {
                        Some(execution) => executions.rekey(execution, correlation_id),
                        None => Vec::new(),
                    }
                }
                Ok(_) => Vec::new(),
                Err(failure) => {
                    warn!("[ACTION] Send of {} failed: {}", action_id, failure);
                    let removed = executions
                        .live
                        .remove(&action_id);
                    removed
                        .and_then(|mut execution| execution.fail(failure.to_string()))
                        .map(|outcome| Effect {
                            step: Step::Complete(outcome),
                            command: command.clone(),
                            component_id: component_id.clone(),
                        })
                        .into_iter()
                        .collect()
                }
            };
            executions.settle_in_flight();
            effects
        };
        for effect in effects {
            self.shared
                .apply(effect);
        }
        Ok(reference)
    }

    /// Number of actions still waiting for their outcome.
    pub fn live_action_count(&self) -> usize {
        self.shared
            .executions
            .lock()
            .live
            .len()
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
}
