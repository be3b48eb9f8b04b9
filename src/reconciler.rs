// Connection table reconciliation
//
// Every snapshot carries the full list of live connections. The store merges
// it by id: known connections are updated in place, new ones are appended,
// and connections missing from the snapshot are either frozen as completed
// (keep-closed) or dropped.

use crate::model::{Connection, ConnectionRecord, Snapshot};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Global traffic counters from the latest snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub upload: u64,
    pub download: u64,
}

#[derive(Debug)]
pub struct ConnectionStore {
    connections: Vec<Connection>, // insertion order
    index: HashMap<String, usize>, // id -> position in `connections`
    keep_closed: bool,
    totals: Totals,
    published: Arc<[Connection]>,
}

impl ConnectionStore {
    pub fn new(keep_closed: bool) -> Self {
        Self {
            connections: Vec::new(),
            index: HashMap::new(),
            keep_closed,
            totals: Totals::default(),
            published: Arc::from(Vec::new()),
        }
    }

    /// Record the snapshot's totals and reconcile its connection list
    pub fn feed_snapshot(&mut self, snapshot: Snapshot) -> Arc<[Connection]> {
        self.totals = Totals {
            upload: snapshot.upload_total,
            download: snapshot.download_total,
        };
        self.feed(snapshot.connections)
    }

    /// Reconcile a full connection list against the current state
    pub fn feed(&mut self, records: Vec<ConnectionRecord>) -> Arc<[Connection]> {
        let incoming: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();

        let mut added = 0usize;
        for record in records {
            match self.index.get(&record.id) {
                Some(&position) => {
                    let existing = &mut self.connections[position];
                    // Completed connections are frozen
                    if !existing.completed {
                        existing.update_from(record);
                    }
                }
                None => {
                    self.index
                        .insert(record.id.clone(), self.connections.len());
                    self.connections.push(Connection::from_record(record));
                    added += 1;
                }
            }
        }

        let mut completed = 0usize;
        let mut vanished: HashSet<String> = HashSet::new();
        for conn in &mut self.connections {
            if conn.completed || incoming.contains(&conn.id) {
                continue;
            }
            if self.keep_closed {
                conn.complete();
                completed += 1;
            } else {
                vanished.insert(conn.id.clone());
            }
        }

        if !vanished.is_empty() {
            self.connections.retain(|c| !vanished.contains(&c.id));
            self.rebuild_index();
        }

        if added > 0 || completed > 0 || !vanished.is_empty() {
            log::trace!(
                "Reconciled snapshot: +{} added, {} completed, {} removed, {} tracked",
                added,
                completed,
                vanished.len(),
                self.connections.len()
            );
        }

        self.publish()
    }

    /// Flip the keep-closed preference. Turning it off drops every completed
    /// connection right away.
    pub fn toggle_save(&mut self) -> bool {
        self.keep_closed = !self.keep_closed;

        if !self.keep_closed {
            let before = self.connections.len();
            self.connections.retain(|c| !c.completed);
            if self.connections.len() != before {
                log::debug!(
                    "Purged {} completed connection(s)",
                    before - self.connections.len()
                );
                self.rebuild_index();
            }
            self.publish();
        }

        self.keep_closed
    }

    pub fn keep_closed(&self) -> bool {
        self.keep_closed
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    /// The state as of the last reconciliation, in insertion order
    pub fn connections(&self) -> Arc<[Connection]> {
        Arc::clone(&self.published)
    }

    pub fn get(&self, id: &str) -> Option<&Connection> {
        self.index.get(id).map(|&position| &self.connections[position])
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .connections
            .iter()
            .enumerate()
            .map(|(position, conn)| (conn.id.clone(), position))
            .collect();
    }

    fn publish(&mut self) -> Arc<[Connection]> {
        self.published = Arc::from(self.connections.clone());
        Arc::clone(&self.published)
    }
}

impl Default for ConnectionStore {
    fn default() -> Self {
        Self::new(false)
    }
}
