//! Calculator agent: binary arithmetic on `a` and `b`.

use serde_json::{Value, json};

use crate::bus::Payload;
use crate::registry::Capability;

use super::{AgentSpec, TaskError, handler_fn};

const OPERATIONS: [(&str, &str); 4] = [
    ("add", "Add two numbers"),
    ("subtract", "Subtract two numbers"),
    ("multiply", "Multiply two numbers"),
    ("divide", "Divide two numbers"),
];

pub fn spec(agent_id: &str) -> AgentSpec {
    OPERATIONS.iter().fold(AgentSpec::new(agent_id, "Calculator"), |spec, (op, description)| {
        let op = *op;
        spec.capability(
            Capability::new(op, *description).with_parameters(json!({
                "a": {"type": "number", "description": "First number"},
                "b": {"type": "number", "description": "Second number"},
            })),
            handler_fn(move |_ctx, payload| async move { calculate(op, &payload) }),
        )
    })
}

/// Apply `operation` to the `a` and `b` parameters of `payload`.
pub fn calculate(operation: &str, payload: &Payload) -> Result<Payload, TaskError> {
    let (Some(a), Some(b)) = (param(payload, "a"), param(payload, "b")) else {
        return Err(TaskError::invalid_params("Both 'a' and 'b' parameters are required"));
    };
    let (Some(a), Some(b)) = (as_number(a), as_number(b)) else {
        return Err(TaskError::invalid_params("Parameters 'a' and 'b' must be numbers"));
    };

    let result = match operation {
        "add" => a + b,
        "subtract" => a - b,
        "multiply" => a * b,
        "divide" if b == 0.0 => return Err(TaskError::new("Division by zero is not allowed")),
        "divide" => a / b,
        other => return Err(TaskError::new(format!("Unknown task type: {other}"))),
    };

    let mut out = Payload::new();
    out.insert("result".into(), json!(result));
    out.insert("operation".into(), Value::String(operation.to_string()));
    out.insert("inputs".into(), json!({"a": a, "b": b}));
    Ok(out)
}

fn param<'a>(payload: &'a Payload, name: &str) -> Option<&'a Value> {
    payload.get(name).filter(|v| !v.is_null())
}

/// Numbers and numeric strings are accepted.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}
