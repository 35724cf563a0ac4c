//! Request parameter builders
//!
//! Servers disagree on how they treat empty collections: some reject `[]`
//! for an optional field, others reject a missing required one. Arguments
//! are shaped against the tool's input schema before they go on the wire.

use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};

/// MCP protocol revision requested during the handshake
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// `initialize` parameters identifying this client
pub fn initialize_params(client_name: &str, client_version: &str) -> Map<String, Value> {
    object(json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        }
    }))
}

/// Parameters for a paginated list request
pub fn list_params(cursor: Option<&str>) -> Option<Map<String, Value>> {
    cursor.map(|cursor| object(json!({ "cursor": cursor })))
}

/// `tools/call` parameters
///
/// An empty array or object argument is kept only when `required` names it.
/// When nothing remains the `arguments` member is left out.
pub fn call_tool_params(
    name: &str,
    arguments: &Map<String, Value>,
    required: &HashSet<String>,
) -> Map<String, Value> {
    let shaped: Map<String, Value> = arguments
        .iter()
        .filter(|(key, value)| !is_empty_collection(value) || required.contains(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let mut params = Map::new();
    params.insert("name".to_string(), Value::String(name.to_string()));
    if !shaped.is_empty() {
        params.insert("arguments".to_string(), Value::Object(shaped));
    }
    params
}

/// `prompts/get` parameters; an empty argument map is left out
pub fn get_prompt_params(name: &str, arguments: &HashMap<String, String>) -> Map<String, Value> {
    if arguments.is_empty() {
        object(json!({ "name": name }))
    } else {
        object(json!({ "name": name, "arguments": arguments }))
    }
}

/// `resources/read` parameters
pub fn read_resource_params(uri: &str) -> Map<String, Value> {
    object(json!({ "uri": uri }))
}

/// Required argument names per tool, read from a raw `tools/list` result
pub fn required_arguments(list_tools_result: &Value) -> HashMap<String, HashSet<String>> {
    list_tools_result
        .get("tools")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?.to_string();
            let required = tool
                .pointer("/inputSchema/required")
                .and_then(Value::as_array)
                .map(|names| {
                    names
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<HashSet<String>>()
                })
                .unwrap_or_default();
            Some((name, required))
        })
        .collect()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(members) => members,
        _ => Map::new(),
    }
}

fn is_empty_collection(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty(),
        Value::Object(members) => members.is_empty(),
        _ => false,
    }
}
