use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Rule kind that references a named rule-set; rendered with its payload
pub const RULE_SET: &str = "RuleSet";

/// Connection metadata as reported by the control API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub host: String,
    #[serde(rename = "destinationIP")]
    pub destination_ip: String,
    #[serde(deserialize_with = "port_string")]
    pub destination_port: String,
    pub network: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sourceIP", default)]
    pub source_ip: String,
    #[serde(default, deserialize_with = "port_string")]
    pub source_port: String,
}

/// One connection entry of a pushed snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub metadata: Metadata,
    pub chains: Vec<String>,
    pub rule: String,
    #[serde(default)]
    pub rule_payload: String,
    pub start: DateTime<Utc>,
    pub upload: u64,
    pub download: u64,
    // Older daemons leave the rates out; the store derives them from counter deltas
    #[serde(default)]
    pub upload_speed: Option<u64>,
    #[serde(default)]
    pub download_speed: Option<u64>,
    #[serde(default)]
    pub completed: bool,
}

/// Full-state push from the connection feed (not a delta)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub upload_total: u64,
    pub download_total: u64,
    #[serde(deserialize_with = "null_as_empty")]
    pub connections: Vec<ConnectionRecord>,
}

/// A tracked connection, as held by the connection store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: String,
    pub metadata: Metadata,
    pub chains: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
    pub start: DateTime<Utc>,
    pub upload: u64,
    pub download: u64,
    pub upload_speed: u64,
    pub download_speed: u64,
    pub completed: bool,
}

impl Connection {
    /// Start tracking a connection seen for the first time
    pub fn from_record(record: ConnectionRecord) -> Self {
        Self {
            upload_speed: record.upload_speed.unwrap_or(0),
            download_speed: record.download_speed.unwrap_or(0),
            id: record.id,
            metadata: record.metadata,
            chains: record.chains,
            rule: record.rule,
            rule_payload: record.rule_payload,
            start: record.start,
            upload: record.upload,
            download: record.download,
            completed: false,
        }
    }

    /// Overwrite counters, rates and metadata from a newer snapshot entry
    pub fn update_from(&mut self, record: ConnectionRecord) {
        self.upload_speed = record
            .upload_speed
            .unwrap_or_else(|| record.upload.saturating_sub(self.upload));
        self.download_speed = record
            .download_speed
            .unwrap_or_else(|| record.download.saturating_sub(self.download));
        self.upload = record.upload;
        self.download = record.download;
        self.metadata = record.metadata;
        self.chains = record.chains;
        self.rule = record.rule;
        self.rule_payload = record.rule_payload;
    }

    /// Freeze the connection once it has left the live list
    pub fn complete(&mut self) {
        self.completed = true;
        self.upload_speed = 0;
        self.download_speed = 0;
    }
}

/// Decode a single feed frame into a snapshot
pub fn decode_snapshot(frame: &[u8]) -> Result<Snapshot> {
    serde_json::from_slice(frame).context("Failed to parse snapshot frame")
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ConnectionRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ConnectionRecord>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Ports arrive as strings from Clash and as numbers from some forks
fn port_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(text) => text,
        Port::Number(number) => number.to_string(),
    })
}
