//! Canonical JSON form and digests
//!
//! Object keys are sorted; array order is preserved. Numbers use the
//! serde_json default rendering, so NaN/Inf never enter the flow.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form: sorted object keys, no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let rendered: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        to_canonical_json(v)
                    )
                })
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

/// SHA-256 of the canonical form, hex-encoded
pub fn canonical_digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}
