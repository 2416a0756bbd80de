//! Application-facing façade over both links

use crate::{
    command::{Command, CommandHandle, CommandPayload},
    constants::MAX_EVENT_QUEUE_SIZE,
    error::CallCtlResult,
    event::{event_channel, EventStream},
    jid::Jid,
    manager::{ManagerMessage, Translator, TranslatorOptions},
    signaling::{InboundStanza, ReplyBody, SignalingConnection, SignalingOptions},
    transport::{ManagerTransport, SignalingTransport},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A signaling transport with its inbound side and the address it signs in as.
pub struct SignalingLink {
    transport: Arc<dyn SignalingTransport>,
    inbound: mpsc::Receiver<InboundStanza>,
    jid: Jid,
}

impl SignalingLink {
    /// Bundle the parts of a signaling link.
    pub fn new<T>(transport: T, inbound: mpsc::Receiver<InboundStanza>, jid: Jid) -> Self
    where
        T: SignalingTransport + 'static,
    {
        Self {
            transport: Arc::new(transport),
            inbound,
            jid,
        }
    }
}

/// A switch-management transport with its inbound side.
pub struct ManagerLink {
    transport: Arc<dyn ManagerTransport>,
    inbound: mpsc::Receiver<ManagerMessage>,
}

impl ManagerLink {
    /// Bundle the parts of a switch-management link.
    pub fn new<T>(transport: T, inbound: mpsc::Receiver<ManagerMessage>) -> Self
    where
        T: ManagerTransport + 'static,
    {
        Self {
            transport: Arc::new(transport),
            inbound,
        }
    }
}

/// Options for [`Client::start`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Capacity of the shared event stream. Default: 1000.
    pub event_queue_size: usize,
    /// Signaling connection options. Its `event_queue_size` is unused here.
    pub signaling: SignalingOptions,
    /// Translator options.
    pub translator: TranslatorOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            signaling: SignalingOptions::default(),
            translator: TranslatorOptions::default(),
        }
    }
}

/// Client handle (Clone + Send)
///
/// Routes each command to the link it belongs to. Both links publish into
/// one [`EventStream`].
#[derive(Debug, Clone)]
pub struct Client {
    signaling: SignalingConnection,
    translator: Translator,
}

impl Client {
    /// Start both links' reader tasks.
    pub fn start(
        signaling: SignalingLink,
        manager: ManagerLink,
        options: ClientOptions,
    ) -> (Self, EventStream) {
        let (sink, stream) = event_channel(options.event_queue_size);
        let connection = SignalingConnection::spawn(
            signaling.transport,
            signaling.inbound,
            signaling.jid,
            options.signaling,
            sink.clone(),
        );
        let translator = Translator::spawn(
            manager.transport,
            manager.inbound,
            sink,
            options.translator,
        );
        (
            Client {
                signaling: connection,
                translator,
            },
            stream,
        )
    }

    /// Submit a command.
    ///
    /// Signaling commands wait for their reply (bounded by the write
    /// timeout) and the handle carries it. Actions return once sent; the
    /// handle carries their reference and the outcome arrives later.
    pub async fn submit(&self, command: Command) -> CallCtlResult<CommandHandle> {
        debug!("Submitting command {}", command.id());
        let reply = match command.payload() {
            CommandPayload::Signaling(_) => {
                self.signaling
                    .write(&command)
                    .await?
            }
            CommandPayload::Action(_) => ReplyBody::Ref(
                self.translator
                    .dispatch(&command)
                    .await?,
            ),
        };
        Ok(CommandHandle::new(command, reply))
    }

    /// The signaling connection.
    pub fn signaling(&self) -> &SignalingConnection {
        &self.signaling
    }

    /// The switch-management translator.
    pub fn translator(&self) -> &Translator {
        &self.translator
    }
}
