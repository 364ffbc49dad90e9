//! Echo agent: string transforms on the `message` parameter.

use serde_json::{Value, json};

use crate::bus::Payload;
use crate::registry::Capability;

use super::{AgentSpec, TaskError, handler_fn};

const OPERATIONS: [(&str, &str); 3] = [
    ("echo", "Echo back a message"),
    ("uppercase", "Convert message to uppercase"),
    ("reverse", "Reverse a message"),
];

pub fn spec(agent_id: &str) -> AgentSpec {
    OPERATIONS.iter().fold(AgentSpec::new(agent_id, "Echo"), |spec, (op, description)| {
        let op = *op;
        spec.capability(
            Capability::new(op, *description).with_parameters(json!({
                "message": {"type": "string", "description": "Message to process"},
            })),
            handler_fn(move |_ctx, payload| async move { transform(op, &payload) }),
        )
    })
}

/// Apply `operation` to `payload["message"]`; a missing message is empty.
pub fn transform(operation: &str, payload: &Payload) -> Result<Payload, TaskError> {
    let text = match payload.get("message") {
        None | Some(Value::Null) => "",
        Some(Value::String(s)) => s.as_str(),
        Some(_) => return Err(TaskError::invalid_params("Parameter 'message' must be a string")),
    };

    let result = match operation {
        "echo" => text.to_string(),
        "uppercase" => text.to_uppercase(),
        "reverse" => text.chars().rev().collect(),
        other => return Err(TaskError::new(format!("Unknown task type: {other}"))),
    };

    let mut out = Payload::new();
    out.insert("result".into(), Value::String(result));
    out.insert("operation".into(), Value::String(operation.to_string()));
    out.insert("original".into(), Value::String(text.to_string()));
    Ok(out)
}
