// Common types used across multiple domains and layers
//
// These types are shared between the kernel and domain layers to avoid
// circular dependencies while maintaining type safety.

use std::collections::BTreeMap;

/// Field name → value mapping used for extracted data and ground truth.
///
/// Ordered so that serialized payloads and scoring output are stable.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Render a field value as text for comparison and display.
///
/// `null` and empty strings yield `None`; numbers and booleans use their JSON
/// form; arrays and objects are serialized compactly.
pub fn field_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
