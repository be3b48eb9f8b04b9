// Derived table rows: labels, sort comparators and the device filter

use crate::model::{Connection, Metadata};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A display-ready connection row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRow {
    pub id: String,
    pub host: String,
    pub network: String,
    pub kind: String,
    pub chains: String,
    pub rule: String,
    pub start: DateTime<Utc>,
    pub upload: u64,
    pub download: u64,
    pub upload_speed: u64,
    pub download_speed: u64,
    pub source_ip: String,
    pub completed: bool,
}

impl From<&Connection> for ConnectionRow {
    fn from(conn: &Connection) -> Self {
        Self {
            id: conn.id.clone(),
            host: host_label(&conn.metadata),
            network: conn.metadata.network.to_uppercase(),
            kind: conn.metadata.kind.clone(),
            chains: chains_label(&conn.chains),
            rule: rule_label(&conn.rule, &conn.rule_payload),
            start: conn.start,
            upload: conn.upload,
            download: conn.download,
            upload_speed: conn.upload_speed,
            download_speed: conn.download_speed,
            source_ip: conn.metadata.source_ip.clone(),
            completed: conn.completed,
        }
    }
}

/// `host:port`, falling back to the destination IP when no host was sniffed
pub fn host_label(metadata: &Metadata) -> String {
    let host = if metadata.host.is_empty() {
        &metadata.destination_ip
    } else {
        &metadata.host
    };
    format!("{}:{}", host, metadata.destination_port)
}

/// Chains are collected outermost-first; the last hop is displayed first
pub fn chains_label(chains: &[String]) -> String {
    chains
        .iter()
        .rev()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" / ")
}

pub fn rule_label(rule: &str, payload: &str) -> String {
    if rule == crate::model::RULE_SET {
        format!("{}({})", rule, payload)
    } else {
        rule.to_string()
    }
}

/// Build rows for every connection, keeping store order
pub fn build_rows(connections: &[Connection]) -> Vec<ConnectionRow> {
    connections.iter().map(ConnectionRow::from).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    Host,
    Network,
    Type,
    Chains,
    Rule,
    Speed,
    Upload,
    Download,
    Time,
}

impl SortColumn {
    pub const ALL: [SortColumn; 9] = [
        SortColumn::Host,
        SortColumn::Network,
        SortColumn::Type,
        SortColumn::Chains,
        SortColumn::Rule,
        SortColumn::Speed,
        SortColumn::Upload,
        SortColumn::Download,
        SortColumn::Time,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            SortColumn::Host => "Host",
            SortColumn::Network => "Network",
            SortColumn::Type => "Type",
            SortColumn::Chains => "Chains",
            SortColumn::Rule => "Rule",
            SortColumn::Speed => "Speed",
            SortColumn::Upload => "Upload",
            SortColumn::Download => "Download",
            SortColumn::Time => "Time",
        }
    }

    /// Traffic columns are most useful largest-first
    pub fn sort_desc_first(&self) -> bool {
        matches!(
            self,
            SortColumn::Speed | SortColumn::Upload | SortColumn::Download
        )
    }

    pub fn next(&self) -> SortColumn {
        let position = Self::ALL.iter().position(|c| c == self).unwrap_or(0);
        Self::ALL[(position + 1) % Self::ALL.len()]
    }

    /// Ascending comparator; callers apply the sort direction
    pub fn compare(&self, a: &ConnectionRow, b: &ConnectionRow) -> Ordering {
        match self {
            SortColumn::Host => a.host.cmp(&b.host),
            SortColumn::Network => a.network.cmp(&b.network),
            SortColumn::Type => a.kind.cmp(&b.kind),
            SortColumn::Chains => a.chains.cmp(&b.chains),
            SortColumn::Rule => a.rule.cmp(&b.rule),
            SortColumn::Speed => a
                .download_speed
                .cmp(&b.download_speed)
                .then(a.upload_speed.cmp(&b.upload_speed)),
            SortColumn::Upload => a.upload.cmp(&b.upload),
            SortColumn::Download => a.download.cmp(&b.download),
            // Inverted: newest connections come first in ascending order
            SortColumn::Time => b.start.cmp(&a.start),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortState {
    pub column: SortColumn,
    pub desc: bool,
}

impl Default for SortState {
    fn default() -> Self {
        Self {
            column: SortColumn::Time,
            desc: false,
        }
    }
}

impl SortState {
    /// Select a column; selecting the active one flips the direction
    pub fn select(&mut self, column: SortColumn) {
        if self.column == column {
            self.desc = !self.desc;
        } else {
            self.column = column;
            self.desc = column.sort_desc_first();
        }
    }

    pub fn toggle_direction(&mut self) {
        self.desc = !self.desc;
    }

    /// Stable sort, so equal rows keep store order in both directions
    pub fn apply(&self, rows: &mut [ConnectionRow]) {
        let column = self.column;
        if self.desc {
            rows.sort_by(|a, b| column.compare(a, b).reverse());
        } else {
            rows.sort_by(|a, b| column.compare(a, b));
        }
    }

    pub fn indicator(&self) -> &'static str {
        if self.desc { " ↓" } else { " ↑" }
    }
}

/// Source addresses with their connection counts, ordered by address label
pub fn device_counts(rows: &[ConnectionRow]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for row in rows.iter().filter(|r| !r.source_ip.is_empty()) {
        *counts.entry(row.source_ip.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(label, count)| (label.to_string(), count))
        .collect()
}

/// Keep only rows from `device`; `None` keeps everything
pub fn filter_by_device(rows: Vec<ConnectionRow>, device: Option<&str>) -> Vec<ConnectionRow> {
    match device {
        None => rows,
        Some(device) => rows.into_iter().filter(|r| r.source_ip == device).collect(),
    }
}
