use serde_json::{ json, Value };

/// Result of a vendor command: a markdown rendering for people, and the JSON
/// context (under a `Vendor.Object` key) plus raw response for automation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub readable: String,
    pub context_key: Option<String>,
    pub key_field: Option<&'static str>,
    pub context: Value,
    pub raw: Value,
}

impl CommandOutput {
    pub fn new(
        readable: String,
        context_key: &str,
        key_field: Option<&'static str>,
        context: Value,
        raw: Value
    ) -> Self {
        CommandOutput {
            readable,
            context_key: Some(context_key.to_string()),
            key_field,
            context,
            raw,
        }
    }

    pub fn message(readable: impl Into<String>) -> Self {
        CommandOutput {
            readable: readable.into(),
            context_key: None,
            key_field: None,
            context: Value::Null,
            raw: Value::Null,
        }
    }

    pub fn to_json(&self) -> Value {
        let context = match &self.context_key {
            Some(k) => json!({ k.as_str(): self.context }),
            None => json!({}),
        };
        json!({
            "readable": self.readable,
            "key_field": self.key_field,
            "context": context,
            "raw": self.raw,
        })
    }
}

/// Title suffix used when a paged search has more results.
pub fn next_page_note(resp: &Value, what: &str) -> String {
    if resp.get("last").and_then(Value::as_bool).unwrap_or(false) {
        String::new()
    } else {
        format!(" (To get the next {}, run the command with the next page)", what)
    }
}
