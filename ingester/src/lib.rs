use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::error::EventError;

pub mod app_context;
pub mod config;
pub mod consumer;
pub mod error;
pub mod hub;
pub mod metric_consts;
pub mod personless;
pub mod pipeline;
pub mod teams;
pub mod testing;

// A spawned lookup, plus the indices of every event in the batch waiting
// on its result.
pub struct WithIndices<T> {
    pub indices: Vec<usize>,
    pub inner: JoinHandle<T>,
}

// Postgres doesn't like nulls (u0000) in strings, so we replace them with uFFFD.
pub fn sanitize_string(s: String) -> String {
    s.replace('\u{0000}', "\u{FFFD}")
}

pub fn needs_sanitization(s: &str) -> bool {
    s.contains('\u{0000}')
}

// Remove null bytes from all strings found in an arbitrary JSON structure.
pub fn recursively_sanitize_properties(
    id: Uuid,
    value: &mut serde_json::Value,
    depth: usize,
) -> Result<(), EventError> {
    if depth > 64 {
        // We don't want to recurse too deeply, in case we have a circular reference or something.
        return Err(EventError::Malformed("recursion limit exceeded".to_string()));
    }
    match value {
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                recursively_sanitize_properties(id, v, depth + 1)?;
            }
        }
        serde_json::Value::Array(arr) => {
            for v in arr.iter_mut() {
                recursively_sanitize_properties(id, v, depth + 1)?;
            }
        }
        serde_json::Value::String(s) => {
            if needs_sanitization(s) {
                warn!("Sanitizing null bytes from string in event {}", id);
                *s = sanitize_string(s.clone());
            }
        }
        _ => {}
    }
    Ok(())
}
