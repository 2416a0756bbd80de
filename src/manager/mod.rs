//! Switch-management link: actions answered by a response or by an event
//! stream closed with a terminator

pub mod action;
pub mod message;
pub mod translator;

pub use action::{causal_terminator, ActionExecution, ExecutionState, Step};
pub use message::{Fields, ManagerAction, ManagerMessage, MessageKind, ParseMessageKindError};
pub use translator::{Translator, TranslatorOptions};
