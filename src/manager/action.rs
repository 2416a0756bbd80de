//! Per-request execution of a switch-management action

use super::message::{ManagerMessage, MessageKind};
use crate::{
    command::Command,
    constants::CAUSAL_ACTIONS,
    event::ManagerEvent,
    reason::{Attributes, CompletionReason},
};
use tracing::{debug, trace};

/// Terminator event of a causal action, or `None` for a simple one.
///
/// `extra` pairs are consulted before the built-in table. Names match
/// case-insensitively.
pub fn causal_terminator(action: &str, extra: &[(String, String)]) -> Option<String> {
    extra
        .iter()
        .map(|(a, t)| (a.as_str(), t.as_str()))
        .chain(
            CAUSAL_ACTIONS
                .iter()
                .copied(),
        )
        .find(|(a, _)| a.eq_ignore_ascii_case(action))
        .map(|(_, terminator)| terminator.to_string())
}

/// Execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Not yet sent.
    Created,
    /// Sent, waiting for the response.
    AwaitingResponse,
    /// Causal action answered, collecting events until the terminator.
    Accumulating,
    /// Outcome emitted; everything else is ignored.
    Complete,
}

/// Effect of feeding one message to an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Not relevant, or the execution is already complete.
    Ignored,
    /// Recorded; nothing to emit yet.
    Pending,
    /// Forward this event to the command's observers.
    Intermediate(ManagerEvent),
    /// Attach this outcome to the command.
    Complete(CompletionReason),
}

/// The response fields kept until completion.
#[derive(Debug, Clone)]
struct ResponsePart {
    message: Option<String>,
    attributes: Attributes,
}

/// One command's exchange with the switch-management endpoint.
///
/// Feeds on every message carrying its correlation id and produces exactly
/// one completion outcome. A causal action completes once both its response
/// and its terminator event arrived, in either order.
#[derive(Debug)]
pub struct ActionExecution {
    command: Command,
    action_id: String,
    component_id: String,
    terminator: Option<String>,
    state: ExecutionState,
    response: Option<ResponsePart>,
    accumulated: Attributes,
    events: Vec<ManagerEvent>,
    closing: Option<Attributes>,
}

impl ActionExecution {
    /// New execution for `command`. A `terminator` makes it causal.
    pub fn new(
        command: Command,
        action_id: impl Into<String>,
        component_id: impl Into<String>,
        terminator: Option<String>,
    ) -> Self {
        Self {
            command,
            action_id: action_id.into(),
            component_id: component_id.into(),
            terminator,
            state: ExecutionState::Created,
            response: None,
            accumulated: Attributes::new(),
            events: Vec::new(),
            closing: None,
        }
    }

    /// Command this execution completes.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Correlation id.
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Re-key after the transport assigned its own correlation id.
    pub(crate) fn set_action_id(&mut self, action_id: impl Into<String>) {
        self.action_id = action_id.into();
    }

    /// Resource id handed to the command as its reference.
    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// `true` for actions answered by an event stream.
    pub fn is_causal(&self) -> bool {
        self.terminator
            .is_some()
    }

    /// Current state.
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Intermediate events received so far, in arrival order.
    pub fn events(&self) -> &[ManagerEvent] {
        &self.events
    }

    /// `created → awaiting response`.
    pub fn sent(&mut self) {
        if self.state == ExecutionState::Created {
            self.state = ExecutionState::AwaitingResponse;
        }
    }

    /// Feed one message carrying this execution's correlation id.
    pub fn handle(&mut self, message: &ManagerMessage) -> Step {
        if self.state == ExecutionState::Complete {
            trace!("[ACTION] {} already complete, ignoring", self.action_id);
            return Step::Ignored;
        }
        match message.kind() {
            MessageKind::Error => {
                let details = message
                    .message()
                    .unwrap_or("action failed");
                self.finish(CompletionReason::error(details))
            }
            MessageKind::Response => self.on_response(message),
            MessageKind::Event => self.on_event(message),
        }
    }

    /// Fail with a local error (send failure, link down). `None` once
    /// already complete.
    pub fn fail(&mut self, details: impl Into<String>) -> Option<CompletionReason> {
        match self.finish(CompletionReason::error(details)) {
            Step::Complete(reason) => Some(reason),
            _ => None,
        }
    }

    fn on_response(&mut self, message: &ManagerMessage) -> Step {
        if self.response.is_some() {
            debug!("[ACTION] Duplicate response for {}", self.action_id);
            return Step::Ignored;
        }
        let part = ResponsePart {
            message: message
                .message()
                .map(str::to_string),
            attributes: message.attributes(),
        };
        if !self.is_causal() {
            return self.finish(CompletionReason::success(part.message, part.attributes));
        }
        self.response = Some(part);
        if self.closing.is_some() {
            return self.finish_causal();
        }
        self.state = ExecutionState::Accumulating;
        Step::Pending
    }

    fn on_event(&mut self, message: &ManagerMessage) -> Step {
        let Some(terminator) = self
            .terminator
            .as_deref()
        else {
            debug!(
                "[ACTION] Event {} for simple action {}, ignoring",
                message
                    .name()
                    .unwrap_or_default(),
                self.action_id
            );
            return Step::Ignored;
        };
        let name = message
            .name()
            .unwrap_or_default();
        if name.eq_ignore_ascii_case(terminator) || message.is_list_complete() {
            self.closing = Some(message.attributes());
            if self.response.is_some() {
                return self.finish_causal();
            }
            return Step::Pending;
        }

        let attributes = message.attributes();
        self.accumulated
            .merge(&attributes);
        let event = ManagerEvent::new(name, Some(self.component_id.clone()), attributes);
        self.events
            .push(event.clone());
        Step::Intermediate(event)
    }

    /// Response fields overlaid by every event overlaid by the terminator.
    fn finish_causal(&mut self) -> Step {
        let (message, mut attributes) = match self
            .response
            .take()
        {
            Some(part) => (part.message, part.attributes),
            None => (None, Attributes::new()),
        };
        attributes.merge(&self.accumulated);
        if let Some(closing) = self
            .closing
            .take()
        {
            attributes.merge(&closing);
        }
        self.finish(CompletionReason::success(message, attributes))
    }

    fn finish(&mut self, reason: CompletionReason) -> Step {
        if self.state == ExecutionState::Complete {
            return Step::Ignored;
        }
        debug!("[ACTION] {} complete: {}", self.action_id, reason.name());
        self.state = ExecutionState::Complete;
        Step::Complete(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ActionRequest;

    const ACTION_ID: &str = "552a9d9f-46d7-45d8-a257-06fe95f48d99";

    fn execution(name: &str) -> ActionExecution {
        let command = Command::action(ActionRequest::new(name));
        let mut execution = ActionExecution::new(
            command,
            ACTION_ID,
            "comp-1",
            causal_terminator(name, &[]),
        );
        execution.sent();
        execution
    }

    fn status_response() -> ManagerMessage {
        ManagerMessage::response()
            .with_action_id(ACTION_ID)
            .with_message("Channel status will follow")
            .with_field("Exten", "idonno")
            .with_field("Context", "default")
            .with_field("Hint", "")
            .with_field("Status", "-1")
    }

    fn status_attributes() -> Attributes {
        [
            ("exten", "idonno"),
            ("context", "default"),
            ("hint", ""),
            ("status", "-1"),
        ]
        .into_iter()
        .collect()
    }

    fn channel_event() -> ManagerMessage {
        ManagerMessage::event("CoreShowChannel")
            .with_action_id(ACTION_ID)
            .with_field("Channel", "SIP/127.0.0.1-00000013")
            .with_field("UniqueID", "1287686437.19")
            .with_field("Context", "adhearsion")
    }

    fn terminator() -> ManagerMessage {
        ManagerMessage::event("CoreShowChannelsComplete")
            .with_action_id(ACTION_ID)
            .with_field("EventList", "Complete")
            .with_field("ListItems", "3")
    }

    #[test]
    fn causal_table_lookup() {
        assert_eq!(
            causal_terminator("coreshowchannels", &[]).as_deref(),
            Some("CoreShowChannelsComplete")
        );
        assert_eq!(
            causal_terminator("SIPpeers", &[]).as_deref(),
            Some("PeerlistComplete")
        );
        assert_eq!(causal_terminator("ExtensionStatus", &[]), None);

        let extra = vec![("PJSIPShowEndpoints".to_string(), "EndpointListComplete".to_string())];
        assert_eq!(
            causal_terminator("PJSIPShowEndpoints", &extra).as_deref(),
            Some("EndpointListComplete")
        );
    }

    #[test]
    fn simple_action_completes_on_response() {
        let mut exec = execution("ExtensionStatus");
        assert!(!exec.is_causal());
        assert_eq!(exec.state(), ExecutionState::AwaitingResponse);

        let step = exec.handle(&status_response());
        assert_eq!(
            step,
            Step::Complete(CompletionReason::success(
                Some("Channel status will follow".into()),
                status_attributes()
            ))
        );
        assert_eq!(exec.state(), ExecutionState::Complete);
        assert_eq!(exec.handle(&status_response()), Step::Ignored);
    }

    #[test]
    fn causal_action_merges_response_events_and_terminator() {
        let mut exec = execution("CoreShowChannels");
        assert!(exec.is_causal());

        assert_eq!(exec.handle(&status_response()), Step::Pending);
        assert_eq!(exec.state(), ExecutionState::Accumulating);

        match exec.handle(&channel_event()) {
            Step::Intermediate(event) => {
                assert_eq!(event.name(), "CoreShowChannel");
                assert_eq!(event.component_id(), Some("comp-1"));
                assert_eq!(
                    event
                        .attributes()
                        .get("channel"),
                    Some("SIP/127.0.0.1-00000013")
                );
                assert_eq!(
                    event
                        .attributes()
                        .get("actionid"),
                    None
                );
            }
            other => panic!("expected intermediate event, got {:?}", other),
        }

        let Step::Complete(reason) = exec.handle(&terminator()) else {
            panic!("terminator should complete the action");
        };
        assert_eq!(reason.message(), Some("Channel status will follow"));
        let attrs = reason
            .attributes()
            .unwrap();
        assert_eq!(attrs.get("exten"), Some("idonno"));
        assert_eq!(attrs.get("channel"), Some("SIP/127.0.0.1-00000013"));
        // The event overwrote the response's context.
        assert_eq!(attrs.get("context"), Some("adhearsion"));
        assert_eq!(attrs.get("eventlist"), Some("Complete"));
        assert_eq!(attrs.get("listitems"), Some("3"));
        assert_eq!(exec.events().len(), 1);
    }

    #[test]
    fn terminator_before_response_waits_for_it() {
        let mut exec = execution("CoreShowChannels");
        assert!(matches!(exec.handle(&channel_event()), Step::Intermediate(_)));
        assert_eq!(exec.handle(&terminator()), Step::Pending);
        assert!(matches!(
            exec.handle(&status_response()),
            Step::Complete(CompletionReason::Success { .. })
        ));
    }

    #[test]
    fn list_complete_marker_terminates() {
        let mut exec = execution("QueueStatus");
        exec.handle(&ManagerMessage::response().with_action_id(ACTION_ID));
        let end = ManagerMessage::event("SomethingElseComplete")
            .with_action_id(ACTION_ID)
            .with_field("EventList", "Complete");
        assert!(matches!(exec.handle(&end), Step::Complete(_)));
    }

    #[test]
    fn error_completes_and_later_events_are_ignored() {
        let mut exec = execution("CoreShowChannels");
        assert_eq!(
            exec.handle(&ManagerMessage::error("Action failed").with_action_id(ACTION_ID)),
            Step::Complete(CompletionReason::error("Action failed"))
        );
        assert_eq!(exec.handle(&channel_event()), Step::Ignored);
        assert_eq!(exec.handle(&terminator()), Step::Ignored);
        assert!(exec
            .events()
            .is_empty());
    }

    #[test]
    fn fail_is_single_shot() {
        let mut exec = execution("ExtensionStatus");
        assert_eq!(
            exec.fail("link down"),
            Some(CompletionReason::error("link down"))
        );
        assert_eq!(exec.fail("again"), None);
    }

    #[test]
    fn events_on_simple_action_are_ignored() {
        let mut exec = execution("Originate");
        assert_eq!(exec.handle(&channel_event()), Step::Ignored);
        assert_eq!(exec.state(), ExecutionState::AwaitingResponse);
    }
}
