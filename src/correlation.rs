//! Correlation state shared by a signaling connection and its callers
//!
//! One coarse lock guards every map: inserts come from writers, resolves and
//! deletes from the reader task, and they interleave freely.

use crate::{
    command::{Command, Reference},
    error::{CallCtlError, CallCtlResult},
    reason::{Attributes, CompletionReason},
    signaling::Reply,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A request waiting for its reply. Consumed exactly once.
struct PendingRequest {
    slot: oneshot::Sender<Reply>,
    created: Instant,
}

#[derive(Default)]
struct Tables {
    /// transport request id → result slot
    pending: HashMap<String, PendingRequest>,
    /// transport request id → originating command
    commands: HashMap<String, Command>,
    /// resource id → transport request id
    resources: HashMap<String, String>,
    /// call id → domain
    calls: HashMap<String, String>,
}

impl Tables {
    fn forget(&mut self, transport_id: &str) -> Option<Command> {
        let command = self
            .commands
            .remove(transport_id);
        if command.is_some() {
            self.resources
                .retain(|_, tid| tid != transport_id);
        }
        command
    }
}

/// Pending requests, command cross-references and call routing.
#[derive(Default)]
pub struct CorrelationTable {
    inner: Mutex<Tables>,
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self
            .inner
            .lock();
        f.debug_struct("CorrelationTable")
            .field("pending", &tables.pending.len())
            .field("commands", &tables.commands.len())
            .field("calls", &tables.calls.len())
            .finish()
    }
}

impl CorrelationTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the result slot for a transport request id.
    ///
    /// A collision means the id generator is broken, not that the caller
    /// did something wrong.
    pub fn register(&self, transport_id: &str) -> CallCtlResult<oneshot::Receiver<Reply>> {
        let mut tables = self
            .inner
            .lock();
        if tables
            .pending
            .contains_key(transport_id)
        {
            return Err(CallCtlError::DuplicateRequest {
                transport_id: transport_id.to_string(),
            });
        }
        let (slot, rx) = oneshot::channel();
        tables
            .pending
            .insert(
                transport_id.to_string(),
                PendingRequest {
                    slot,
                    created: Instant::now(),
                },
            );
        Ok(rx)
    }

    /// Hand `reply` to the waiting slot and drop the entry.
    ///
    /// The tracked command moves with the reply: a reference reply to a
    /// component-starting command maps the resource back to the request
    /// and leaves the command executing; any other result completes it
    /// successfully; an error reply fails it. All of that is decided under
    /// the same lock that takes the slot, so a writer that times out and
    /// [`cancel`](Self::cancel)s either wins outright or loses before any
    /// mapping exists.
    ///
    /// Returns `false` for an unknown id (late or duplicate reply); that is
    /// logged, never raised, and touches nothing.
    pub fn resolve(&self, transport_id: &str, reply: Reply) -> bool {
        let reference = match &reply {
            Ok(body) => body
                .reference()
                .cloned(),
            Err(_) => None,
        };
        let (pending, command, keeps_resource) = {
            let mut tables = self
                .inner
                .lock();
            let pending = match tables
                .pending
                .remove(transport_id)
            {
                Some(pending) => pending,
                None => {
                    warn!(
                        "[RESOLVE] Reply for unknown request {}, dropping",
                        transport_id
                    );
                    return false;
                }
            };
            let component = reference
                .as_ref()
                .filter(|_| {
                    tables
                        .commands
                        .get(transport_id)
                        .is_some_and(Command::starts_component)
                });
            match component {
                Some(reference) => {
                    tables
                        .resources
                        .insert(reference.id().to_string(), transport_id.to_string());
                    let command = tables
                        .commands
                        .get(transport_id)
                        .cloned();
                    (pending, command, true)
                }
                None => {
                    let command = tables.forget(transport_id);
                    (pending, command, false)
                }
            }
        };

        if let Some(command) = command {
            match &reply {
                Ok(_) if keeps_resource => {
                    debug!(
                        "Command {} started resource {}",
                        transport_id,
                        reference
                            .as_ref()
                            .map(Reference::id)
                            .unwrap_or_default()
                    );
                    command.execute(reference);
                }
                Ok(_) => {
                    debug!("Command {} completed successfully", transport_id);
                    if reference.is_some() {
                        command.execute(reference);
                    }
                    command.settle(CompletionReason::success(None, Attributes::new()));
                }
                Err(error) => {
                    debug!("Command {} failed: {}", transport_id, error.details());
                    command.settle(CompletionReason::error(error.details()));
                }
            }
        }

        debug!(
            "[RESOLVE] {} after {}ms",
            transport_id,
            pending
                .created
                .elapsed()
                .as_millis()
        );
        if pending
            .slot
            .send(reply)
            .is_err()
        {
            debug!("[RESOLVE] Writer for {} already gone", transport_id);
        }
        true
    }

    /// Purge a request that gave up waiting, along with its command
    /// cross-references. Returns `false` if the reply already won the race.
    pub fn cancel(&self, transport_id: &str) -> bool {
        let mut tables = self
            .inner
            .lock();
        let was_pending = tables
            .pending
            .remove(transport_id)
            .is_some();
        if was_pending {
            tables.forget(transport_id);
        }
        was_pending
    }

    /// Remember which command a transport request carries.
    pub fn track_command(&self, transport_id: &str, command: Command) {
        self.inner
            .lock()
            .commands
            .insert(transport_id.to_string(), command);
    }

    /// Link a resource id assigned by the remote side to the request that
    /// created it.
    pub fn map_command(&self, resource_id: &str, transport_id: &str) {
        self.inner
            .lock()
            .resources
            .insert(resource_id.to_string(), transport_id.to_string());
    }

    /// Transport request id that created a resource.
    pub fn lookup_transport_id(&self, resource_id: &str) -> Option<String> {
        self.inner
            .lock()
            .resources
            .get(resource_id)
            .cloned()
    }

    /// `resource id → transport id → command`.
    pub fn original_command_for(&self, resource_id: &str) -> Option<Command> {
        let tables = self
            .inner
            .lock();
        let transport_id = tables
            .resources
            .get(resource_id)?;
        tables
            .commands
            .get(transport_id)
            .cloned()
    }

    /// Like [`original_command_for`](Self::original_command_for), removing
    /// both entries. Used when the resource's command completes.
    pub fn take_command_for_resource(&self, resource_id: &str) -> Option<Command> {
        let mut tables = self
            .inner
            .lock();
        let transport_id = tables
            .resources
            .remove(resource_id)?;
        tables.forget(&transport_id)
    }

    /// Record the domain a call was last heard from. Last write wins.
    pub fn record_call_domain(&self, call_id: &str, domain: &str) {
        let mut tables = self
            .inner
            .lock();
        if let Some(previous) = tables
            .calls
            .insert(call_id.to_string(), domain.to_string())
        {
            if previous != domain {
                debug!(
                    "Call {} moved from domain {} to {}",
                    call_id, previous, domain
                );
            }
        }
    }

    /// Domain to route a call's commands to.
    pub fn domain_for(&self, call_id: &str) -> Option<String> {
        self.inner
            .lock()
            .calls
            .get(call_id)
            .cloned()
    }

    /// Forget a call's routing entry.
    pub fn remove_call(&self, call_id: &str) -> Option<String> {
        self.inner
            .lock()
            .calls
            .remove(call_id)
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .pending
            .len()
    }

    /// Number of tracked commands.
    pub fn tracked_command_count(&self) -> usize {
        self.inner
            .lock()
            .commands
            .len()
    }

    /// Drop every pending slot, waking their writers with a closed channel,
    /// and return the commands that were still tracked.
    pub fn close(&self) -> Vec<Command> {
        let mut tables = self
            .inner
            .lock();
        tables
            .pending
            .clear();
        tables
            .resources
            .clear();
        tables
            .commands
            .drain()
            .map(|(_, command)| command)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, CommandState, SignalingCommand};
    use crate::signaling::{ReplyBody, StanzaError};

    fn command() -> Command {
        Command::call("c1", SignalingCommand::new(CommandKind::Input))
    }

    #[test]
    fn duplicate_registration_fails() {
        let table = CorrelationTable::new();
        let _slot = table
            .register("iq-1")
            .unwrap();
        let err = table
            .register("iq-1")
            .unwrap_err();
        assert!(matches!(
            err,
            CallCtlError::DuplicateRequest { ref transport_id } if transport_id == "iq-1"
        ));
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test]
    async fn resolve_delivers_and_removes() {
        let table = CorrelationTable::new();
        let slot = table
            .register("iq-1")
            .unwrap();
        assert!(table.resolve("iq-1", Ok(ReplyBody::Empty)));
        assert_eq!(
            slot.await
                .unwrap(),
            Ok(ReplyBody::Empty)
        );
        assert_eq!(table.pending_count(), 0);
        // A duplicate reply finds nothing.
        assert!(!table.resolve("iq-1", Ok(ReplyBody::Empty)));
    }

    #[test]
    fn resolve_unknown_is_dropped() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(
            "nope",
            Err(StanzaError::new("cancel", "item-not-found"))
        ));
    }

    #[tokio::test]
    async fn reference_reply_maps_component_and_leaves_it_running() {
        let table = CorrelationTable::new();
        let cmd = command();
        let slot = table
            .register("iq-1")
            .unwrap();
        table.track_command("iq-1", cmd.clone());

        assert!(table.resolve("iq-1", Ok(ReplyBody::Ref(Reference::new("comp-1")))));
        assert!(slot
            .await
            .unwrap()
            .is_ok());
        assert_eq!(cmd.state(), CommandState::Executing);
        assert_eq!(
            table
                .lookup_transport_id("comp-1")
                .as_deref(),
            Some("iq-1")
        );
        assert_eq!(table.tracked_command_count(), 1);
    }

    #[test]
    fn reference_reply_to_dial_completes_without_mapping() {
        let table = CorrelationTable::new();
        let dial = Command::connection(SignalingCommand::new(CommandKind::Dial));
        let _slot = table
            .register("iq-1")
            .unwrap();
        table.track_command("iq-1", dial.clone());

        assert!(table.resolve("iq-1", Ok(ReplyBody::Ref(Reference::new("call-9")))));
        assert!(dial.is_complete());
        assert_eq!(
            dial.reference()
                .map(|r| r.id().to_string()),
            Some("call-9".to_string())
        );
        assert!(table
            .lookup_transport_id("call-9")
            .is_none());
        assert_eq!(table.tracked_command_count(), 0);
    }

    #[test]
    fn error_reply_fails_and_forgets_command() {
        let table = CorrelationTable::new();
        let cmd = command();
        let _slot = table
            .register("iq-1")
            .unwrap();
        table.track_command("iq-1", cmd.clone());

        assert!(table.resolve("iq-1", Err(StanzaError::new("cancel", "item-not-found"))));
        assert_eq!(
            cmd.completion()
                .and_then(|r| r
                    .details()
                    .map(str::to_string)),
            Some("cancel: item-not-found".to_string())
        );
        assert_eq!(table.tracked_command_count(), 0);
    }

    #[test]
    fn reply_after_cancel_touches_nothing() {
        let table = CorrelationTable::new();
        let cmd = command();
        let _slot = table
            .register("iq-1")
            .unwrap();
        table.track_command("iq-1", cmd.clone());

        assert!(table.cancel("iq-1"));
        assert!(!table.resolve("iq-1", Ok(ReplyBody::Ref(Reference::new("comp-1")))));
        assert!(table
            .lookup_transport_id("comp-1")
            .is_none());
        assert_eq!(table.tracked_command_count(), 0);
        assert_eq!(cmd.state(), CommandState::Created);
    }

    #[test]
    fn cancel_purges_request_and_command() {
        let table = CorrelationTable::new();
        let _slot = table
            .register("iq-1")
            .unwrap();
        table.track_command("iq-1", command());
        table.map_command("comp-1", "iq-1");

        assert!(table.cancel("iq-1"));
        assert_eq!(table.pending_count(), 0);
        assert_eq!(table.tracked_command_count(), 0);
        assert!(table
            .lookup_transport_id("comp-1")
            .is_none());
        assert!(!table.cancel("iq-1"));
    }

    #[test]
    fn original_command_two_level_lookup() {
        let table = CorrelationTable::new();
        let cmd = command();
        table.track_command("iq-7", cmd.clone());
        table.map_command("comp-7", "iq-7");

        assert_eq!(
            table
                .lookup_transport_id("comp-7")
                .as_deref(),
            Some("iq-7")
        );
        let found = table
            .original_command_for("comp-7")
            .unwrap();
        assert_eq!(found.id(), cmd.id());
        assert!(table
            .original_command_for("other")
            .is_none());

        let taken = table
            .take_command_for_resource("comp-7")
            .unwrap();
        assert_eq!(taken.id(), cmd.id());
        assert!(table
            .original_command_for("comp-7")
            .is_none());
        assert_eq!(table.tracked_command_count(), 0);
    }

    #[test]
    fn call_domain_last_write_wins() {
        let table = CorrelationTable::new();
        assert!(table
            .domain_for("c1")
            .is_none());
        table.record_call_domain("c1", "a.example.com");
        table.record_call_domain("c1", "b.example.com");
        assert_eq!(
            table
                .domain_for("c1")
                .as_deref(),
            Some("b.example.com")
        );
        assert_eq!(
            table
                .remove_call("c1")
                .as_deref(),
            Some("b.example.com")
        );
    }

    #[tokio::test]
    async fn close_wakes_writers() {
        let table = CorrelationTable::new();
        let slot = table
            .register("iq-1")
            .unwrap();
        table.track_command("iq-1", command());
        let orphans = table.close();
        assert_eq!(orphans.len(), 1);
        assert!(slot.await.is_err());
    }
}
