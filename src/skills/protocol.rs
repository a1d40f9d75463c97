//! Skill output protocol.
//!
//! A skill may print anything it likes. The only trusted part of its output
//! is the JSON object placed between [`OUTPUT_START`] and the first
//! [`OUTPUT_END`] that follows it:
//!
//! ```text
//! fetching forecast...
//! ---SKILL_OUTPUT_START---
//! {"temperature": 21}
//! ---SKILL_OUTPUT_END---
//! done
//! ```
//!
//! Only the first marker pair counts. The payload must be a JSON object;
//! arrays and scalars are rejected even though they are valid JSON.

use serde_json::{Map, Value};

use crate::error::{Result, SkillError};

pub const OUTPUT_START: &str = "---SKILL_OUTPUT_START---";
pub const OUTPUT_END: &str = "---SKILL_OUTPUT_END---";

/// Extracts the delimited JSON object from raw skill output.
pub fn parse_skill_output(output: &str) -> Result<Map<String, Value>> {
    let start = output
        .find(OUTPUT_START)
        .ok_or_else(|| SkillError::parse(format!("start marker {OUTPUT_START} not found")))?;
    let body = &output[start + OUTPUT_START.len()..];

    let end = body.find(OUTPUT_END).ok_or_else(|| {
        SkillError::parse(format!(
            "end marker {OUTPUT_END} not found after start marker"
        ))
    })?;
    let payload = body[..end].trim();

    if payload.is_empty() {
        return Err(SkillError::parse("empty payload between output markers"));
    }

    let value: Value = serde_json::from_str(payload)
        .map_err(|e| SkillError::parse(format!("payload is not valid JSON: {e}")))?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(SkillError::parse(format!(
            "payload must be a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

/// Wraps a JSON object in output markers, the way a skill is expected to.
pub fn wrap_skill_output(payload: &Value) -> String {
    format!("{OUTPUT_START}\n{payload}\n{OUTPUT_END}\n")
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
