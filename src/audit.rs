//! Bounded, append-only ring of admin-audit entries — separate from the
//! usage meter so a query against one never scans the other.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::meter::{DEFAULT_CAPACITY, UsageQuery};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl AuditEntry {
    pub fn new(kind: impl Into<String>, actor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: kind.into(),
            actor: actor.into(),
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

pub struct AuditLog {
    ring: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut ring = self.ring.lock().unwrap();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    pub fn query(&self, q: &UsageQuery) -> Vec<AuditEntry> {
        let ring = self.ring.lock().unwrap();
        let mut matched: Vec<AuditEntry> = ring
            .iter()
            .filter(|e| q.since.is_none_or(|s| e.timestamp >= s))
            .filter(|e| q.until.is_none_or(|u| e.timestamp <= u))
            .cloned()
            .collect();
        matched.reverse();
        let start = q.offset.min(matched.len());
        let end = q
            .limit
            .map(|l| (start + l).min(matched.len()))
            .unwrap_or(matched.len());
        matched[start..end].to_vec()
    }

    pub fn export_json(&self, q: &UsageQuery) -> String {
        serde_json::to_string(&self.query(q)).unwrap_or_default()
    }

    pub fn export_csv(&self, q: &UsageQuery) -> anyhow::Result<String> {
        let mut writer = csv::Writer::from_writer(vec![]);
        for e in self.query(q) {
            writer.serialize(AuditCsvRow {
                timestamp: e.timestamp,
                kind: e.kind,
                actor: e.actor,
                message: e.message,
                details: e.details.to_string(),
            })?;
        }
        Ok(String::from_utf8(writer.into_inner()?)?)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize)]
struct AuditCsvRow {
    timestamp: DateTime<Utc>,
    kind: String,
    actor: String,
    message: String,
    details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_at_capacity() {
        let log = AuditLog::new(2);
        log.record(AuditEntry::new("store.load_warning", "system", "a"));
        log.record(AuditEntry::new("key.created", "admin", "b"));
        log.record(AuditEntry::new("key.revoked", "admin", "c"));
        assert_eq!(log.len(), 2);
        let entries = log.query(&UsageQuery::default());
        assert_eq!(entries[0].message, "c");
    }
}
