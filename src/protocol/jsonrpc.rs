//! JSON-RPC 2.0 envelopes
//!
//! The envelope types are the MCP schema's own. What lives here is the client
//! glue around them: builders, inbound parsing, response correlation and the
//! answers owed to requests a server initiates.

use super::methods;
use rust_mcp_sdk::schema::schema_utils::RpcErrorCodes;
use rust_mcp_sdk::schema::{JsonrpcNotificationParams, JsonrpcRequestParams, Result as ResultObject};
use serde::Serialize;
use serde_json::{Map, Value};

pub use rust_mcp_sdk::schema::{
    JsonrpcError, JsonrpcMessage, JsonrpcNotification, JsonrpcRequest, JsonrpcResponse, RequestId,
    RpcError,
};

/// Request with a numeric id
pub fn request(id: i64, method: &str, params: Option<Map<String, Value>>) -> JsonrpcRequest {
    let params = params.map(|extra| JsonrpcRequestParams {
        extra: Some(extra),
        ..Default::default()
    });
    JsonrpcRequest::new(RequestId::Integer(id), method.to_string(), params)
}

pub fn notification(method: &str, params: Option<Map<String, Value>>) -> JsonrpcNotification {
    let params = params.map(|extra| JsonrpcNotificationParams {
        extra: Some(extra),
        ..Default::default()
    });
    JsonrpcNotification::new(method.to_string(), params)
}

/// Parse one line or event payload
///
/// Anything that is not a JSON-RPC 2.0 message (banners, log lines, JSON
/// without the `jsonrpc` marker) is an error.
pub fn parse(text: &str) -> Result<JsonrpcMessage, serde_json::Error> {
    serde_json::from_str(text.trim())
}

/// Answer to one request: a result or an error object
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Result(JsonrpcResponse),
    Error(JsonrpcError),
}

impl Reply {
    pub fn success(id: RequestId, result: Map<String, Value>) -> Self {
        Reply::Result(JsonrpcResponse::new(
            id,
            ResultObject {
                extra: Some(result),
                ..Default::default()
            },
        ))
    }

    pub fn failure(id: RequestId, error: RpcError) -> Self {
        Reply::Error(JsonrpcError::new(error, id))
    }

    pub fn id(&self) -> &RequestId {
        match self {
            Reply::Result(response) => &response.id,
            Reply::Error(error) => &error.id,
        }
    }

    /// Result as plain JSON, or the server's error object
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            Reply::Result(response) => {
                let mut object = response.result.extra.unwrap_or_default();
                if let Some(meta) = response.result.meta {
                    object.insert("_meta".to_string(), Value::Object(meta));
                }
                Ok(Value::Object(object))
            }
            Reply::Error(error) => Err(error.error),
        }
    }
}

/// Reply a client gives to a request initiated by the server
///
/// Only `ping` is supported; every other method is refused so the server
/// never waits on us.
pub fn reply_to_server_request(request: &JsonrpcRequest) -> Reply {
    match request.method.as_str() {
        methods::PING => Reply::success(request.id.clone(), Map::new()),
        other => Reply::failure(
            request.id.clone(),
            RpcError::new(
                RpcErrorCodes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
                None,
            ),
        ),
    }
}

/// Correlation key for a request id
///
/// Numbers and strings never collide: `1` and `"1"` map to different keys.
pub fn id_key(id: &RequestId) -> String {
    match id {
        RequestId::Integer(n) => n.to_string(),
        RequestId::String(s) => format!("{s:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_messages() {
        let response = parse(r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#).unwrap();
        assert!(matches!(response, JsonrpcMessage::Response(ref r) if id_key(&r.id) == "7"));

        let error =
            parse(r#"{"jsonrpc":"2.0","id":"a","error":{"code":-32601,"message":"nope"}}"#).unwrap();
        assert!(matches!(error, JsonrpcMessage::Error(ref e) if e.error.code == -32601));

        let notification =
            parse(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#).unwrap();
        assert!(matches!(
            notification,
            JsonrpcMessage::Notification(ref n) if n.method == methods::TOOLS_LIST_CHANGED
        ));

        let request = parse(r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#).unwrap();
        assert!(matches!(request, JsonrpcMessage::Request(_)));
    }

    #[test]
    fn test_non_protocol_text_rejected() {
        for text in [
            "Usage: server <directory>",
            "Error: API_KEY environment variable is required",
            r#"{"level":"info","msg":"starting"}"#,
            r#"{"jsonrpc":"1.0","id":1,"result":{}}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
            "[1,2,3]",
        ] {
            assert!(parse(text).is_err(), "{text} should be rejected");
        }
    }

    #[test]
    fn test_reply_to_server_request() {
        let reply = reply_to_server_request(&request(9, "ping", None));
        assert_eq!(id_key(reply.id()), "9");
        assert_eq!(reply.into_result().unwrap(), json!({}));

        let sampling = request(10, "sampling/createMessage", Some(Map::new()));
        let reply = reply_to_server_request(&sampling);
        assert_eq!(id_key(reply.id()), "10");
        assert_eq!(reply.into_result().unwrap_err().code, -32601);
    }

    #[test]
    fn test_id_keys_distinguish_types() {
        assert_ne!(
            id_key(&RequestId::Integer(1)),
            id_key(&RequestId::String("1".to_string()))
        );
        assert_eq!(id_key(&request(5, "x", None).id), "5");
    }

    #[test]
    fn test_request_wire_shape() {
        let value = serde_json::to_value(request(1, "tools/list", None)).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}));

        let mut params = Map::new();
        params.insert("cursor".to_string(), json!("c2"));
        let value = serde_json::to_value(request(2, "tools/list", Some(params))).unwrap();
        assert_eq!(value["params"], json!({"cursor": "c2"}));
    }

    #[test]
    fn test_result_meta_kept() {
        let message = parse(r#"{"jsonrpc":"2.0","id":1,"result":{"_meta":{"t":1},"tools":[]}}"#).unwrap();
        let JsonrpcMessage::Response(response) = message else {
            panic!("expected a response");
        };
        assert_eq!(
            Reply::Result(response).into_result().unwrap(),
            json!({"_meta": {"t": 1}, "tools": []})
        );
    }
}
