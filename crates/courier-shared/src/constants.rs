/// Application name
pub const APP_NAME: &str = "Courier";

/// Sender identity stamped on envelopes the server synthesizes itself
pub const SERVER_EVENT_SENDER: &str = "courier-server-event";

/// Session id used on synthesized envelopes
pub const SERVER_EVENT_SESSION: &str = "courier-server";

/// Real-time event carrying an encoded envelope to a connected socket
pub const EVENT_CHAT_MESSAGE: &str = "chat-message";

/// Client event: submit a base64 envelope, answered with a base64 response
pub const EVENT_SUBMIT_SIGNAL_MESSAGE: &str = "submit-signal-message";

/// Client event: comma-separated message ids received by this session
pub const EVENT_CONFIRM_RECEIVED: &str = "confirm-received";

/// Maximum messages returned by one old-messages query
pub const MAX_OLD_MESSAGES: u32 = 10;

/// Newest messages per thread returned by the initial sync
pub const INITIAL_SYNC_PER_THREAD: u32 = 10;

/// Maximum users returned by a username or phone search
pub const MAX_USER_SEARCH_RESULTS: u32 = 20;

/// Page size used when draining unreceived messages
pub const UNRECEIVED_PAGE_SIZE: u32 = 50;

/// Maximum payload size accepted in one envelope (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
