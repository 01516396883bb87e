//! Wire protocol: command/reply framing between server and agents, the data
//! envelope carrying uploaded reports, and the report payload itself.
//!
//! Field names follow the agent's JSON casing; byte payloads travel as
//! base64 strings.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Only supported envelope version.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Messages with a larger inner payload are dropped (counted, not fatal).
pub const MAX_DATA_SIZE: usize = 4 * 1024 * 1024;

/// Ack code meaning "accepted, but stop sending and reconnect".
pub const THROTTLE_CODE: u16 = 299;

/// A command sent to an agent over its control session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Cmd {
    pub ts: Option<DateTime<Utc>>,
    #[serde(rename = "AgentUUID")]
    pub agent_uuid: String,
    pub cmd: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub id: u64,
}

/// The agent's answer to a [`Cmd`], correlated by `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Reply {
    pub id: u64,
    pub cmd: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub error: String,
}

/// Envelope for uploaded data: identifies the producing service and protocol
/// version; `data` is the serialized report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DataEnvelope {
    pub protocol_version: String,
    pub service: String,
    pub created: Option<DateTime<Utc>>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Ack sent back on the data session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Response {
    pub code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// First line of every agent session: which agent, which channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hello {
    #[serde(rename = "AgentUUID")]
    pub agent_uuid: String,
    /// "agent" for the command channel, "data" for report upload.
    pub channel: String,
}

// ---------------------------------------------------------------------------
// Report payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Report {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub run_time: f64,
    pub slow_log_file: String,
    pub slow_log_file_size: i64,
    pub start_offset: i64,
    pub end_offset: i64,
    pub stop_offset: i64,
    pub rate_limit: i64,
    pub global: Option<GlobalClass>,
    pub class: Vec<Class>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GlobalClass {
    pub total_queries: i64,
    pub unique_queries: i64,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Class {
    /// Checksum of the fingerprint; the class's stable external identifier.
    pub id: String,
    pub fingerprint: String,
    pub total_queries: i64,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub example: Option<Example>,
    pub user_sources: Vec<UserSource>,
    pub metrics: Option<Metrics>,
}

/// Concrete query text representative of a class, "YYYY-MM-DD HH:MM:SS" ts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Example {
    pub ts: String,
    pub db: String,
    pub query_time: f64,
    pub query: String,
    pub explain: String,
}

impl Example {
    /// Parse the example timestamp into unix seconds. Accepts the agent's
    /// datetime layout and RFC 3339.
    pub fn ts_unix(&self) -> Option<i64> {
        if self.ts.is_empty() {
            return None;
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(&self.ts, "%Y-%m-%d %H:%M:%S") {
            return Some(naive.and_utc().timestamp());
        }
        DateTime::parse_from_rfc3339(&self.ts)
            .ok()
            .map(|dt| dt.timestamp())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserSource {
    pub user: String,
    pub host: String,
    pub ts: Option<DateTime<Utc>>,
    pub count: i64,
}

/// Per-class metric statistics keyed by metric name. Time and number metrics
/// carry the six statistics; counters carry only a sum.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Metrics {
    pub time_metrics: HashMap<String, Stats>,
    pub number_metrics: HashMap<String, Stats>,
    pub bool_metrics: HashMap<String, BoolStats>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Stats {
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub med: Option<f64>,
    pub p95: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BoolStats {
    pub sum: Option<f64>,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// A monitored database endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Instance {
    pub subsystem: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "ParentUUID")]
    pub parent_uuid: String,
    #[serde(rename = "DSN")]
    pub dsn: String,
    pub name: String,
    pub distro: String,
    pub version: String,
    pub created: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
}

pub const SUBSYSTEM_MYSQL: &str = "mysql";
pub const SUBSYSTEM_MONGO: &str = "mongo";
pub const SUBSYSTEM_OS: &str = "os";

#[derive(Debug, Clone, Copy)]
pub struct Subsystem {
    pub id: i64,
    pub name: &'static str,
}

/// Static subsystem table; the store holds only ids.
pub const SUBSYSTEMS: &[Subsystem] = &[
    Subsystem {
        id: 1,
        name: SUBSYSTEM_MYSQL,
    },
    Subsystem {
        id: 2,
        name: SUBSYSTEM_MONGO,
    },
    Subsystem {
        id: 3,
        name: SUBSYSTEM_OS,
    },
];

pub fn subsystem_by_name(name: &str) -> Option<Subsystem> {
    SUBSYSTEMS.iter().copied().find(|s| s.name == name)
}

pub fn subsystem_by_id(id: i64) -> Option<Subsystem> {
    SUBSYSTEMS.iter().copied().find(|s| s.id == id)
}

// ---------------------------------------------------------------------------

/// Go-style base64 encoding for `[]byte` JSON fields.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
