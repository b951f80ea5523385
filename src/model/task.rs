//! Task records and their wire format.
//!
//! The serialized record is the exchange unit: producers store it, backends
//! move it between status buckets without parsing it, workers decode it.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Globally unique task identifier.
///
/// Built as `{type}-{params hash}-{creation micros}-{random tag}` so that
/// resubmitting identical type and params never collides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    fn generate(task_type: &str, params: &serde_json::Value, created_at: DateTime<Utc>) -> Self {
        let tag = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{task_type}-{}-{}-{}",
            params_hash(params),
            created_at.timestamp_micros(),
            &tag[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

/// Content hash of the params; empty for null params.
fn params_hash(params: &serde_json::Value) -> String {
    if params.is_null() {
        return String::new();
    }
    let digest = Sha256::digest(params.to_string().as_bytes());
    hex::encode(&digest[..16])
}

/// A unit of work.
///
/// Wire format: `{"task_id", "task_type", "params", "created_at"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(rename = "task_id")]
    pub id: TaskId,

    /// Selects both the handler and the physical sub-queue.
    pub task_type: String,

    /// Opaque to the engine, consumed only by handlers.
    pub params: serde_json::Value,

    /// Written as RFC 3339. Epoch seconds (integer or fractional) are also
    /// accepted, as other producers store them that way.
    #[serde(deserialize_with = "created_at_from_wire")]
    pub created_at: DateTime<Utc>,

    /// Exact payload this record was decoded from. Transitions must present
    /// the stored bytes, not a re-encoding of them.
    #[serde(skip)]
    raw: Option<String>,
}

impl TaskRecord {
    pub fn new(task_type: impl Into<String>, params: serde_json::Value) -> Self {
        let task_type = task_type.into();
        let created_at = Utc::now();
        Self {
            id: TaskId::generate(&task_type, &params, created_at),
            task_type,
            params,
            created_at,
            raw: None,
        }
    }

    /// Decode a stored payload, remembering it as this record's key.
    pub fn decode(raw: &str) -> Result<Self> {
        let mut record: TaskRecord = serde_json::from_str(raw)?;
        record.raw = Some(raw.to_string());
        Ok(record)
    }

    /// The backend key for this record.
    pub fn key(&self) -> Result<String> {
        match &self.raw {
            Some(raw) => Ok(raw.clone()),
            None => Ok(serde_json::to_string(self)?),
        }
    }
}

fn created_at_from_wire<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Epoch(f64),
        Rfc3339(DateTime<Utc>),
    }

    match Wire::deserialize(deserializer)? {
        Wire::Rfc3339(at) => Ok(at),
        Wire::Epoch(secs) => {
            let micros = (secs * 1_000_000.0).round();
            if !micros.is_finite() {
                return Err(serde::de::Error::custom(format!("created_at out of range: {secs}")));
            }
            DateTime::from_timestamp_micros(micros as i64).ok_or_else(|| {
                serde::de::Error::custom(format!("created_at out of range: {secs}"))
            })
        }
    }
}

impl PartialEq for TaskRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.task_type == other.task_type
            && self.params == other.params
            && self.created_at == other.created_at
    }
}

impl Eq for TaskRecord {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_submissions_get_distinct_ids() {
        let a = TaskRecord::new("resize", json!({"w": 10}));
        let b = TaskRecord::new("resize", json!({"w": 10}));
        assert_ne!(a.id, b.id);
        assert!(a.id.as_str().starts_with("resize-"));
        let hash = a.id.as_str().split('-').nth(1).unwrap();
        assert_eq!(hash.len(), 32);
    }

    #[test]
    fn null_params_have_empty_hash() {
        let t = TaskRecord::new("ping", serde_json::Value::Null);
        assert!(t.id.as_str().starts_with("ping--"));
    }

    #[test]
    fn wire_format_uses_task_prefixed_fields() {
        let t = TaskRecord::new("ping", json!({"a": 1}));
        let v: serde_json::Value = serde_json::from_str(&t.key().unwrap()).unwrap();
        assert_eq!(v["task_id"], json!(t.id.as_str()));
        assert_eq!(v["task_type"], json!("ping"));
        assert_eq!(v["params"], json!({"a": 1}));
        assert!(v.get("created_at").is_some());
    }

    #[test]
    fn decoded_record_reuses_foreign_payload_verbatim() {
        let foreign = r#"{"params": {"b": 2, "a": 1}, "task_type": "x", "task_id": "x-1", "created_at": "2024-01-01T00:00:00Z"}"#;
        let t = TaskRecord::decode(foreign).unwrap();
        assert_eq!(t.key().unwrap(), foreign);
        assert_eq!(t.task_type, "x");
    }

    #[test]
    fn epoch_seconds_created_at_is_accepted() {
        let fractional = r#"{"task_id":"t-1","task_type":"t","params":{},"created_at":1700000000.123}"#;
        let t = TaskRecord::decode(fractional).unwrap();
        assert_eq!(t.created_at.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(t.key().unwrap(), fractional);

        let whole = r#"{"task_id":"t-2","task_type":"t","params":null,"created_at":1700000000}"#;
        let t = TaskRecord::decode(whole).unwrap();
        assert_eq!(t.created_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn malformed_payload_fails_to_decode() {
        assert!(TaskRecord::decode("not json").is_err());
        assert!(TaskRecord::decode(r#"{"task_id": "x"}"#).is_err());
        assert!(
            TaskRecord::decode(r#"{"task_id":"x","task_type":"x","params":{},"created_at":"yesterday"}"#)
                .is_err()
        );
    }
}
