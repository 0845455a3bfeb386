//! The single record type crossing the event pipeline.
//!
//! Producers fill the correlation fields at observation time; the sink fills
//! both time fields and the reverse-DNS host names just before the record is
//! serialized. Field declaration order is the JSON serialization order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One observed occurrence, written as a JSON line by the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub unix_time: i64,
    pub timestamp: String,
    #[serde(rename = "CorrelationID")]
    pub correlation_id: String,
    pub remote_addr: String,
    pub remote_host_name: String,
    pub local_addr: String,
    pub local_host_name: String,
    #[serde(rename = "Type")]
    pub kind: String,
    pub summary: String,
    pub data: Value,
}

impl Event {
    /// Stamp both time fields from a single instant.
    ///
    /// Called exactly once, at sink entry; producers leave the fields zeroed.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        self.unix_time = now.timestamp();
        self.timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    }
}
