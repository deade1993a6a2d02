// ! MCP protocol method name constants
// !
// ! Module contains the method names the connection core sends or matches
// ! on the wire.

// Core protocol methods
pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "notifications/initialized";
pub const PING: &str = "ping";

// Cancellation
pub const CANCELLED: &str = "notifications/cancelled";
pub const CANCEL_REQUEST: &str = "$/cancelRequest";

// Common request methods issued through the connection
pub const TOOLS_LIST: &str = "tools/list";
pub const TOOLS_CALL: &str = "tools/call";
