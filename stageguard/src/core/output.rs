//! Stage output type with factory methods.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The result map a stage returns when it does not fail.
///
/// The supervisor treats any `StageOutput` as success. A stage that wants to
/// report a semantic verdict ("status": "FAIL") puts it in `data`; the
/// payload is opaque to the pipeline core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// The result data.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,

    /// Additional metadata (model used, token counts, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StageOutput {
    /// Creates an output with data.
    #[must_use]
    pub fn ok(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data,
            metadata: HashMap::new(),
        }
    }

    /// Creates an output with no data.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self::default()
    }

    /// Creates an output with a single value.
    #[must_use]
    pub fn ok_value(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut data = HashMap::new();
        data.insert(key.into(), value);
        Self::ok(data)
    }

    /// Adds a single data entry.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Adds a single metadata entry.
    #[must_use]
    pub fn add_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Gets a value from the data.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Gets a string value from the data.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }

    /// Returns true if the output carries no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Converts the output into the opaque payload stored on the state stack.
    #[must_use]
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "data": self.data,
            "metadata": self.metadata,
        })
    }

    /// Reads an output back from a stack payload.
    ///
    /// Payloads that are not shaped like an output are kept whole under a
    /// `"value"` key, so arbitrary pushed contexts still round-trip.
    #[must_use]
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        match payload {
            serde_json::Value::Object(map)
                if map.keys().all(|k| k == "data" || k == "metadata") =>
            {
                serde_json::from_value(payload.clone())
                    .unwrap_or_else(|_| Self::ok_value("value", payload.clone()))
            }
            other => Self::ok_value("value", other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ok_value() {
        let output = StageOutput::ok_value("key", serde_json::json!("value"));
        assert_eq!(output.get("key"), Some(&serde_json::json!("value")));
        assert_eq!(output.get_str("key"), Some("value"));
        assert!(!output.is_empty());
    }

    #[test]
    fn test_ok_empty() {
        let output = StageOutput::ok_empty();
        assert!(output.is_empty());
        assert!(output.metadata.is_empty());
    }

    #[test]
    fn test_with_metadata() {
        let output = StageOutput::ok_empty().add_metadata("model", serde_json::json!("large"));
        assert_eq!(output.metadata.get("model"), Some(&serde_json::json!("large")));
    }

    #[test]
    fn test_payload_round_trip() {
        let output = StageOutput::ok_value("status", serde_json::json!("FAIL"))
            .with_value("score", serde_json::json!(3))
            .add_metadata("tokens", serde_json::json!(1200));

        let payload = output.to_payload();
        assert_eq!(StageOutput::from_payload(&payload), output);
    }

    #[test]
    fn test_from_foreign_payload() {
        let payload = serde_json::json!({"verdict": "ship"});
        let output = StageOutput::from_payload(&payload);
        assert_eq!(output.get("value"), Some(&payload));

        let scalar = StageOutput::from_payload(&serde_json::json!(7));
        assert_eq!(scalar.get("value"), Some(&serde_json::json!(7)));
    }
}
