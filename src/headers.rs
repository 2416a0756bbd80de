//! Typed field names for switch-management messages.

define_parse_error!(
    /// Error returned when parsing an unrecognized switch-management field name.
    ParseManagerHeaderError,
    "manager header"
);

define_wire_enum! {
    error_type: ParseManagerHeaderError,
    /// Field names with a protocol meaning on switch-management messages.
    ///
    /// Everything else on a message is an opaque attribute. Use with
    /// [`Fields::get()`](crate::manager::Fields::get) for type-safe lookups.
    pub enum ManagerHeader {
        Action => "Action",
        ActionId => "ActionID",
        Response => "Response",
        Message => "Message",
        Event => "Event",
        EventList => "EventList",
        ListItems => "ListItems",
    }
}

impl ManagerHeader {
    /// Fields that never land in a completion's attribute set.
    pub(crate) fn is_framing(name: &str) -> bool {
        [
            ManagerHeader::Action,
            ManagerHeader::ActionId,
            ManagerHeader::Response,
            ManagerHeader::Message,
            ManagerHeader::Event,
        ]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h.as_str()))
    }
}
