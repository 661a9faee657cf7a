use crate::domain::packet::{DedupKey, Packet};
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};

/// Row layout of `datetime_created` in the table (no offset, always UTC).
pub const ROW_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Column name for the zero-based channel index `idx`.
pub fn channel_column(idx: usize) -> String {
    format!("Channel_{}", idx + 1)
}

/// Every column of a packet table with `channel_count` channels, in order.
pub fn row_columns(channel_count: usize) -> Vec<String> {
    let mut columns = vec![
        "pub_region".to_string(),
        "datetime_created".to_string(),
        "unix_ms".to_string(),
        "msg_trip_s".to_string(),
        "msg_proc_s".to_string(),
    ];
    columns.extend((0..channel_count).map(channel_column));
    columns
}

/// A packet as persisted, with delivery latency measurements attached.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub pub_region: String,
    pub datetime_created: DateTime<Utc>,
    pub unix_ms: i64,
    pub msg_trip_s: f64,
    pub msg_proc_s: f64,
    pub channels: Vec<f64>,
}

impl StoredRow {
    pub fn from_packet(packet: &Packet, msg_trip_s: f64, msg_proc_s: f64) -> Self {
        Self {
            pub_region: packet.region.clone(),
            datetime_created: packet.created_at,
            unix_ms: packet.unix_ms,
            msg_trip_s,
            msg_proc_s,
            channels: packet.channels.clone(),
        }
    }

    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.unix_ms, self.pub_region.clone())
    }

    /// JSON object keyed by column name, in column order.
    pub fn to_json_row(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("pub_region".to_string(), Value::from(self.pub_region.clone()));
        row.insert(
            "datetime_created".to_string(),
            Value::from(
                self.datetime_created
                    .format(ROW_DATETIME_FORMAT)
                    .to_string(),
            ),
        );
        row.insert("unix_ms".to_string(), Value::from(self.unix_ms));
        row.insert("msg_trip_s".to_string(), float_value(self.msg_trip_s));
        row.insert("msg_proc_s".to_string(), float_value(self.msg_proc_s));
        for (idx, value) in self.channels.iter().enumerate() {
            row.insert(channel_column(idx), float_value(*value));
        }
        row
    }
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
