//! Protocol constants and configuration values

/// Default time a signaling write waits for its reply (3 seconds)
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 3000;

/// Maximum number of queued events before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;

/// Prefix of transport request ids generated by a signaling connection
pub const TRANSPORT_ID_PREFIX: &str = "callctl";

/// Namespace of call-control command and event payloads
pub const CALL_CONTROL_NAMESPACE: &str = "urn:xmpp:rayo:1";

/// `Response:` values classified as a successful switch-management reply.
pub const RESPONSE_SUCCESS_VALUES: &[&str] = &["Success", "Follows", "Goodbye", "Pong"];

/// `Response:` value of a failed switch-management action.
pub const RESPONSE_ERROR_VALUE: &str = "Error";

/// `EventList:` value carried by the event that closes a list stream.
pub const EVENT_LIST_COMPLETE: &str = "Complete";

/// Actions answered by an event stream, with the event that closes it.
///
/// Matched case-insensitively against the action and event names.
pub const CAUSAL_ACTIONS: &[(&str, &str)] = &[
    ("QueueStatus", "QueueStatusComplete"),
    ("SIPpeers", "PeerlistComplete"),
    ("IAXpeers", "PeerlistComplete"),
    ("ParkedCalls", "ParkedCallsComplete"),
    ("DAHDIShowChannels", "DAHDIShowChannelsComplete"),
    ("CoreShowChannels", "CoreShowChannelsComplete"),
    ("DBGet", "DBGetComplete"),
    ("Status", "StatusComplete"),
    ("Agents", "AgentsComplete"),
    ("ConfbridgeList", "ConfbridgeListComplete"),
    ("ConfbridgeListRooms", "ConfbridgeListRoomsComplete"),
];

/// Correlated switch-management messages held while a dispatch is waiting
/// for the transport to report its correlation id.
pub const MAX_UNCLAIMED_MESSAGES: usize = 256;
