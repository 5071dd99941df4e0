use chrono::prelude::*;
use serde::{ Serialize, Serializer };
use serde_derive::Serialize;
use serde_json::{ Map, Value };
use serde_repr::{ Deserialize_repr, Serialize_repr };
use tracing::warn;

use crate::utils;

/// One vendor record as returned by an event source, before normalization.
#[derive(Clone, Debug, PartialEq)]
pub struct RawEvent {
    pub id: String,
    pub occurred_at: String,
    pub severity: String,
    pub summary: String,
    pub detail: Option<Value>,
    /// Vendor field name `detail` was taken from, used to put it back into the
    /// payload in verbose mode.
    pub detail_field: &'static str,
    /// The vendor record without the detail field.
    pub payload: Map<String, Value>,
}

impl RawEvent {
    /// Splits `detail_field` out of a vendor record.
    pub fn from_record(
        id: String,
        occurred_at: String,
        severity: String,
        summary: String,
        detail_field: &'static str,
        mut payload: Map<String, Value>
    ) -> Self {
        let detail = payload.remove(detail_field);
        RawEvent { id, occurred_at, severity, summary, detail, detail_field, payload }
    }

    pub fn strip_detail(&mut self) {
        self.detail = None;
    }

    pub fn into_raw_payload(self) -> Value {
        let mut p = self.payload;
        if let Some(d) = self.detail {
            p.insert(self.detail_field.to_string(), d);
        }
        Value::Object(p)
    }
}

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SeverityScore {
    Unknown = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl SeverityScore {
    /// Case-insensitive vendor severity lookup. Unknown values score 0 and are
    /// logged, they never fail the poll.
    pub fn from_vendor(severity: &str) -> Self {
        match severity.trim().to_lowercase().as_str() {
            "low" => SeverityScore::Low,
            "important" | "medium" => SeverityScore::Medium,
            "critical" | "high" => SeverityScore::High,
            other => {
                warn!(severity = other, "unknown incident severity, setting score to 0");
                SeverityScore::Unknown
            }
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Incident {
    pub name: String,
    #[serde(serialize_with = "serialize_occurred")]
    pub occurred: DateTime<Utc>,
    pub severity_score: SeverityScore,
    pub raw_payload: Value,
}

fn serialize_occurred<S>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where S: Serializer
{
    utils::format_timestamp(t).serialize(serializer)
}
