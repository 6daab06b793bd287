//! Purpose: Define a stable, structured schema for non-fatal stderr notices.
//! Exports: `Notice`, `notice_json`, `notice_time_now`.
//! Role: Shared contract helper for CLI diagnostics (anomalies, progress,
//! generic-key reports).
//! Invariants: Notices are non-fatal and never alter stdout payloads.
//! Invariants: JSON schema is stable once published; fields are additive-only.
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub store: String,
    pub message: String,
    pub details: Map<String, Value>,
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("store".to_string(), json!(notice.store));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}

pub fn notice_time_now() -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::{Notice, notice_json, notice_time_now};
    use serde_json::{Map, Value};

    #[test]
    fn notice_json_has_required_fields() {
        let mut details = Map::new();
        details.insert("key".to_string(), Value::from("geneX"));
        details.insert("anomaly".to_string(), Value::from("shape-mismatch"));

        let notice = Notice {
            kind: "anomaly".to_string(),
            time: "2026-02-01T00:00:00Z".to_string(),
            cmd: "merge".to_string(),
            store: "input1.store".to_string(),
            message: "shape-mismatch at geneX.n".to_string(),
            details,
        };

        let value = notice_json(&notice);
        let obj = value
            .get("notice")
            .and_then(|v| v.as_object())
            .expect("notice object");

        assert_eq!(obj.get("kind").and_then(|v| v.as_str()), Some("anomaly"));
        assert_eq!(obj.get("cmd").and_then(|v| v.as_str()), Some("merge"));
        assert_eq!(
            obj.get("store").and_then(|v| v.as_str()),
            Some("input1.store")
        );
        assert_eq!(
            obj.get("details").and_then(|v| v.get("key")).and_then(|v| v.as_str()),
            Some("geneX")
        );
    }

    #[test]
    fn notice_time_is_rfc3339() {
        let time = notice_time_now();
        assert!(time.contains('T'));
        assert!(time.ends_with('Z') || time.contains('+'));
    }
}
