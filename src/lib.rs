//! Call-control correlation layer for Rust
//!
//! This crate matches application commands to exactly one outcome across two
//! asynchronous links: a stanza-exchange signaling link controlling calls,
//! and a switch-management link whose actions are answered either by a
//! single response or by an event stream closed with a terminator event.
//!
//! # Architecture
//!
//! Each link has a split design:
//! - a handle (Clone + Send) that sends from any task:
//!   [`SignalingConnection`] and [`Translator`]
//! - a background reader task that resolves replies and publishes
//!   everything else on the shared [`EventStream`]
//!
//! [`Client`] bundles both behind `submit(command) → handle`.
//!
//! Transports are supplied by the caller through the [`SignalingTransport`]
//! and [`ManagerTransport`] traits plus an `mpsc::Receiver` of decoded
//! inbound messages. The [`transport::memory`] links play the remote side
//! in-process.
//!
//! # Examples
//!
//! ## Signaling writes
//!
//! ```rust,no_run
//! use callctl_tokio::transport::memory::signaling_link;
//! use callctl_tokio::{
//!     CallCtlError, Command, CommandKind, Event, SignalingCommand, SignalingConnection,
//!     SignalingOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CallCtlError> {
//!     let (transport, inbound, _peer) = signaling_link(256);
//!     let jid = "app@127.0.0.1/voxeo".parse().expect("valid address");
//!     let (conn, mut events) =
//!         SignalingConnection::connect(transport, inbound, jid, SignalingOptions::default());
//!
//!     while let Some(Ok(event)) = events.recv().await {
//!         if let Event::Offer(call) = event {
//!             let answer = Command::call(call.call_id(), SignalingCommand::new(CommandKind::Answer));
//!             conn.write(&answer).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Switch-management actions
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use callctl_tokio::transport::memory::{manager_link, signaling_link};
//! use callctl_tokio::{
//!     ActionRequest, CallCtlError, Client, ClientOptions, Command, ManagerLink, SignalingLink,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CallCtlError> {
//!     let (st, sin, _speer) = signaling_link(256);
//!     let (mt, min, _mpeer) = manager_link(256);
//!     let jid = "app@127.0.0.1".parse().expect("valid address");
//!     let (client, _events) = Client::start(
//!         SignalingLink::new(st, sin, jid),
//!         ManagerLink::new(mt, min),
//!         ClientOptions::default(),
//!     );
//!
//!     let handle = client
//!         .submit(Command::action(ActionRequest::new("CoreShowChannels")))
//!         .await?;
//!     handle.on_intermediate_event(|event| println!("channel: {:?}", event.attributes()));
//!     let reason = handle.await_completion(Duration::from_secs(5)).await?;
//!     println!("{:?}", reason.attributes());
//!     Ok(())
//! }
//! ```

#[macro_use]
mod macros;

pub mod client;
pub mod command;
pub mod correlation;
pub mod error;
pub mod event;
pub mod jid;
pub mod manager;
pub mod node;
pub mod reason;
pub mod signaling;
pub mod transport;

pub mod constants;
pub(crate) mod headers;

pub use client::{Client, ClientOptions, ManagerLink, SignalingLink};
pub use command::{
    ActionRequest, Command, CommandHandle, CommandId, CommandKind, CommandPayload, CommandState,
    ParseCommandKindError, ParseCommandStateError, Reference, SignalingCommand,
};
pub use correlation::CorrelationTable;
pub use error::{CallCtlError, CallCtlResult, TransportFailure};
pub use event::{
    event_channel, Call, CallEvent, CallEventKind, ConnectionStatus, DisconnectReason, Event,
    EventSink, EventStream, Link, ManagerEvent, ParseLinkError,
};
pub use headers::{ManagerHeader, ParseManagerHeaderError};
pub use jid::{Jid, ParseJidError};
pub use manager::{
    ActionExecution, Fields, ManagerAction, ManagerMessage, MessageKind, Translator,
    TranslatorOptions,
};
pub use node::Node;
pub use reason::{Attributes, CompletionReason, InputMode, Outcome, ParseInputModeError};
pub use signaling::{
    Envelope, InboundStanza, IqType, Presence, PresencePayload, Reply, ReplyBody,
    SignalingConnection, SignalingOptions, StanzaError,
};
pub use transport::{ManagerTransport, SignalingTransport};
