//! Switch-management actions and inbound messages

use crate::{
    command::ActionRequest,
    constants::{EVENT_LIST_COMPLETE, RESPONSE_ERROR_VALUE, RESPONSE_SUCCESS_VALUES},
    error::{CallCtlError, CallCtlResult},
    headers::ManagerHeader,
    reason::Attributes,
};
use std::fmt;

/// Ordered key/value block with case-insensitive lookup.
///
/// Keys keep the case they arrived with. Inserting a key already present
/// (in any case) replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    /// Empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. Returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self
            .0
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some((_, v)) => Some(std::mem::replace(v, value)),
            None => {
                self.0
                    .push((key, value));
                None
            }
        }
    }

    /// Look up a field by name, in any case.
    ///
    /// Accepts a [`ManagerHeader`] as well as a plain string.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// `true` if the field is present.
    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.get(key)
            .is_some()
    }

    /// Iterate in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0
            .len()
    }

    /// `true` if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.0
            .is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// Upper-case the first letter of a parameter name (`context` → `Context`).
fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars)
            .collect(),
        None => String::new(),
    }
}

/// Outbound switch-management action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerAction {
    name: String,
    action_id: String,
    fields: Fields,
}

impl ManagerAction {
    /// Action with no parameters.
    pub fn new(name: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_id: action_id.into(),
            fields: Fields::new(),
        }
    }

    /// Build the wire action for an application request.
    pub fn from_request(request: &ActionRequest, action_id: impl Into<String>) -> Self {
        let fields = request
            .params()
            .iter()
            .map(|(k, v)| (capitalize(k), v.clone()))
            .collect();
        Self {
            name: request
                .name()
                .to_string(),
            action_id: action_id.into(),
            fields,
        }
    }

    /// Add a parameter.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .insert(key, value);
        self
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Correlation id every reply and event for this action carries.
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Parameters, excluding `Action` and `ActionID`.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }
}

impl fmt::Display for ManagerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}\r\n{}: {}\r\n",
            ManagerHeader::Action,
            self.name,
            ManagerHeader::ActionId,
            self.action_id
        )?;
        for (k, v) in self
            .fields
            .iter()
        {
            write!(f, "{}: {}\r\n", k, v)?;
        }
        f.write_str("\r\n")
    }
}

define_parse_error!(
    /// Error returned when parsing an unknown message kind.
    ParseMessageKindError,
    "message kind"
);

define_wire_enum! {
    error_type: ParseMessageKindError,
    /// Classification of an inbound switch-management message.
    pub enum MessageKind {
        Response => "response",
        Event => "event",
        Error => "error",
    }
}

/// Inbound switch-management message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerMessage {
    kind: MessageKind,
    fields: Fields,
}

impl ManagerMessage {
    /// Successful response.
    pub fn response() -> Self {
        let mut fields = Fields::new();
        fields.insert(ManagerHeader::Response.as_str(), RESPONSE_SUCCESS_VALUES[0]);
        Self {
            kind: MessageKind::Response,
            fields,
        }
    }

    /// Named event.
    pub fn event(name: impl Into<String>) -> Self {
        let mut fields = Fields::new();
        fields.insert(ManagerHeader::Event.as_str(), name);
        Self {
            kind: MessageKind::Event,
            fields,
        }
    }

    /// Error response with its failure text.
    pub fn error(message: impl Into<String>) -> Self {
        let mut fields = Fields::new();
        fields.insert(ManagerHeader::Response.as_str(), RESPONSE_ERROR_VALUE);
        fields.insert(ManagerHeader::Message.as_str(), message);
        Self {
            kind: MessageKind::Error,
            fields,
        }
    }

    /// Classify a raw field block by its `Response:` or `Event:` field.
    pub fn from_fields(fields: Fields) -> CallCtlResult<Self> {
        let kind = if let Some(response) = fields.get(ManagerHeader::Response) {
            if response.eq_ignore_ascii_case(RESPONSE_ERROR_VALUE) {
                MessageKind::Error
            } else if RESPONSE_SUCCESS_VALUES
                .iter()
                .any(|v| response.eq_ignore_ascii_case(v))
            {
                MessageKind::Response
            } else {
                return Err(CallCtlError::protocol_violation(format!(
                    "unknown response value: {}",
                    response
                )));
            }
        } else if fields.contains(ManagerHeader::Event) {
            MessageKind::Event
        } else {
            return Err(CallCtlError::protocol_violation(
                "message carries neither Response nor Event",
            ));
        };
        Ok(Self { kind, fields })
    }

    /// Set a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .insert(key, value);
        self
    }

    /// Set the correlation id.
    pub fn with_action_id(self, action_id: impl Into<String>) -> Self {
        self.with_field(ManagerHeader::ActionId.as_str(), action_id)
    }

    /// Set the `Message:` field.
    pub fn with_message(self, message: impl Into<String>) -> Self {
        self.with_field(ManagerHeader::Message.as_str(), message)
    }

    /// Response, event or error.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Event name, for events.
    pub fn name(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Event => self
                .fields
                .get(ManagerHeader::Event),
            _ => None,
        }
    }

    /// `Message:` field.
    pub fn message(&self) -> Option<&str> {
        self.fields
            .get(ManagerHeader::Message)
    }

    /// Correlation id, absent on unsolicited events.
    pub fn action_id(&self) -> Option<&str> {
        self.fields
            .get(ManagerHeader::ActionId)
    }

    /// Look up a field.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.fields
            .get(key)
    }

    /// All fields in arrival order.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Fields without the framing ones, keys lower-cased.
    pub fn attributes(&self) -> Attributes {
        self.fields
            .iter()
            .filter(|(k, _)| !ManagerHeader::is_framing(k))
            .collect()
    }

    /// `true` if this event closes a list (`EventList: Complete`).
    pub fn is_list_complete(&self) -> bool {
        self.fields
            .get(ManagerHeader::EventList)
            .is_some_and(|v| v.eq_ignore_ascii_case(EVENT_LIST_COMPLETE))
    }
}
