//! MCP wire protocol: JSON-RPC envelopes, method names and request parameters

pub mod jsonrpc;
pub mod params;

pub use jsonrpc::{
    JsonrpcError, JsonrpcMessage, JsonrpcNotification, JsonrpcRequest, JsonrpcResponse, Reply,
    RequestId, RpcError, id_key, reply_to_server_request,
};

/// MCP method names used by the client
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCE_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
}
