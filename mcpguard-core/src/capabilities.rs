//! Capability augmentation: injects the proxy-provided restart tool into
//! the child's advertised capability set.
//!
//! Both transforms clone their input and never mutate the child's original
//! response, so diagnostic tooling can still inspect what the child
//! actually reported. Both are idempotent: augmenting an already-augmented
//! set changes nothing.

use serde_json::{json, Map, Value};

pub const RESTART_TOOL_NAME: &str = "restart_server";

/// Descriptor of the synthetic tool. The schema has no required fields:
/// a restart takes no arguments.
pub fn restart_tool() -> Value {
    json!({
        "name": RESTART_TOOL_NAME,
        "description": "Restart the underlying MCP server process. The client session survives the restart; tool listings are refreshed once the new server is ready.",
        "inputSchema": {
            "type": "object",
            "properties": {}
        }
    })
}

/// Appends the restart tool to a `tools/list` result.
pub fn augment_tools_result(result: &Value) -> Value {
    let mut augmented = result.clone();
    if let Some(obj) = augmented.as_object_mut() {
        let tools = obj.entry("tools").or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(tools) = tools {
            let present = tools
                .iter()
                .any(|tool| tool.get("name").and_then(Value::as_str) == Some(RESTART_TOOL_NAME));
            if !present {
                tools.push(restart_tool());
            }
        }
    }
    augmented
}

/// Augments an `initialize` result: guarantees the tools capability with
/// list-changed notifications (the proxy emits one after every restart),
/// and appends the restart tool when the handshake carries an inline tool
/// list.
pub fn augment_initialize_result(result: &Value) -> Value {
    let mut augmented = if result.get("tools").map_or(false, Value::is_array) {
        augment_tools_result(result)
    } else {
        result.clone()
    };

    if let Some(obj) = augmented.as_object_mut() {
        let capabilities = obj
            .entry("capabilities")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(capabilities) = capabilities.as_object_mut() {
            let tools_capability = capabilities
                .entry("tools")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(tools_capability) = tools_capability.as_object_mut() {
                tools_capability.insert("listChanged".to_string(), Value::Bool(true));
            }
        }
    }
    augmented
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_result_gains_exactly_one_entry() {
        let native = json!({"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]});
        let augmented = augment_tools_result(&native);
        assert_eq!(augmented["tools"].as_array().unwrap().len(), 2);
        assert_eq!(augmented["tools"][1]["name"], RESTART_TOOL_NAME);
    }

    #[test]
    fn augmentation_is_idempotent() {
        let native = json!({"tools": [{"name": "echo"}]});
        let once = augment_tools_result(&native);
        let twice = augment_tools_result(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn augmentation_does_not_mutate_the_input() {
        let native = json!({"tools": []});
        let before = native.clone();
        let _ = augment_tools_result(&native);
        assert_eq!(native, before);

        let handshake = json!({"capabilities": {}});
        let before = handshake.clone();
        let _ = augment_initialize_result(&handshake);
        assert_eq!(handshake, before);
    }

    #[test]
    fn initialize_result_advertises_list_changed() {
        let native = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "stub", "version": "0.0.0"}
        });
        let augmented = augment_initialize_result(&native);
        assert_eq!(augmented["capabilities"]["tools"]["listChanged"], true);
        // Everything else passes through untouched.
        assert_eq!(augmented["serverInfo"], native["serverInfo"]);
    }

    #[test]
    fn initialize_result_without_capabilities_gets_them() {
        let augmented = augment_initialize_result(&json!({"protocolVersion": "2024-11-05"}));
        assert_eq!(augmented["capabilities"]["tools"]["listChanged"], true);
    }

    #[test]
    fn inline_tool_list_in_handshake_is_augmented() {
        let native = json!({"capabilities": {}, "tools": [{"name": "echo"}]});
        let augmented = augment_initialize_result(&native);
        assert_eq!(augmented["tools"].as_array().unwrap().len(), 2);
    }
}
