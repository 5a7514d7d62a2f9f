//! Mapping from topic records to warehouse rows.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::source::Record;

/// Column holding payloads that are not JSON objects.
pub const RAW_PAYLOAD_COLUMN: &str = "raw_payload";

/// A row ready for a streaming insert.
#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseRow {
    /// Stable per-record id so the warehouse can drop replayed inserts.
    pub insert_id: String,
    pub json: Map<String, Value>,
    pub partition: i32,
    pub offset: i64,
}

/// Build the row for `record`.
///
/// JSON object payloads keep their fields; anything else is stored
/// base64-encoded under [`RAW_PAYLOAD_COLUMN`]. Ingestion metadata is
/// added under underscore-prefixed columns.
pub fn to_row(topic: &str, record: &Record, inserted_at: DateTime<Utc>) -> WarehouseRow {
    let mut json = match serde_json::from_slice::<Value>(&record.value) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert(
                RAW_PAYLOAD_COLUMN.to_string(),
                Value::String(STANDARD.encode(&record.value)),
            );
            map
        }
    };

    json.insert("_partition".to_string(), Value::from(record.partition));
    json.insert("_offset".to_string(), Value::from(record.offset));
    json.insert(
        "_key".to_string(),
        record
            .key
            .as_ref()
            .map_or(Value::Null, |k| Value::String(String::from_utf8_lossy(k).into_owned())),
    );
    json.insert(
        "_event_time".to_string(),
        Value::String(record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    json.insert(
        "_insert_time".to_string(),
        Value::String(inserted_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );

    WarehouseRow {
        insert_id: format!("{topic}-{}-{}", record.partition, record.offset),
        json,
        partition: record.partition,
        offset: record.offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(value: &'static [u8]) -> Record {
        Record {
            partition: 2,
            offset: 41,
            key: Some(Bytes::from_static(b"user-7")),
            value: Bytes::from_static(value),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_json_object_keeps_fields_and_adds_metadata() {
        let row = to_row(
            "events",
            &record(br#"{"id":"a1","priority":2}"#),
            Utc::now(),
        );

        assert_eq!(row.insert_id, "events-2-41");
        assert_eq!(row.json["id"], "a1");
        assert_eq!(row.json["priority"], 2);
        assert_eq!(row.json["_partition"], 2);
        assert_eq!(row.json["_offset"], 41);
        assert_eq!(row.json["_key"], "user-7");
        assert!(row.json.contains_key("_event_time"));
        assert!(row.json.contains_key("_insert_time"));
        assert!(!row.json.contains_key(RAW_PAYLOAD_COLUMN));
    }

    #[test]
    fn test_non_json_payload_is_base64_encoded() {
        let row = to_row("events", &record(b"\x00\x01binary"), Utc::now());
        assert_eq!(row.json[RAW_PAYLOAD_COLUMN], STANDARD.encode(b"\x00\x01binary"));
    }

    #[test]
    fn test_json_scalar_is_treated_as_raw() {
        let row = to_row("events", &record(b"42"), Utc::now());
        assert_eq!(row.json[RAW_PAYLOAD_COLUMN], STANDARD.encode(b"42"));
    }

    #[test]
    fn test_missing_key_is_null() {
        let mut record = record(b"{}");
        record.key = None;
        let row = to_row("events", &record, Utc::now());
        assert_eq!(row.json["_key"], Value::Null);
    }
}
