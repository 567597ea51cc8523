//! Bounded, append-only ring of usage events. Every tool call — allowed or
//! denied — gets one entry; the critical path never waits on this beyond an
//! `O(1)` amortized push, and the ring never grows unbounded.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keystore::mask_key;

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub api_key: String,
    pub key_name: String,
    pub tool: String,
    pub credits_charged: i64,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UsageQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub allowed: Option<bool>,
    pub limit: Option<usize>,
    pub offset: usize,
}

pub struct Meter {
    ring: Mutex<VecDeque<UsageEvent>>,
    capacity: usize,
}

impl Meter {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn record(&self, event: UsageEvent) {
        let mut ring = self.ring.lock().unwrap();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    pub fn query(&self, q: &UsageQuery) -> Vec<UsageEvent> {
        let ring = self.ring.lock().unwrap();
        let mut matched: Vec<UsageEvent> = ring
            .iter()
            .filter(|e| q.since.is_none_or(|s| e.timestamp >= s))
            .filter(|e| q.until.is_none_or(|u| e.timestamp <= u))
            .filter(|e| q.allowed.is_none_or(|a| e.allowed == a))
            .cloned()
            .collect();
        matched.reverse(); // newest first
        let start = q.offset.min(matched.len());
        let end = q
            .limit
            .map(|l| (start + l).min(matched.len()))
            .unwrap_or(matched.len());
        matched[start..end].to_vec()
    }

    pub fn export_json(&self, q: &UsageQuery) -> String {
        let events = self.masked(self.query(q));
        serde_json::to_string(&events).unwrap_or_default()
    }

    pub fn export_csv(&self, q: &UsageQuery) -> anyhow::Result<String> {
        let events = self.masked(self.query(q));
        let mut writer = csv::Writer::from_writer(vec![]);
        for e in events {
            writer.serialize(e)?;
        }
        Ok(String::from_utf8(writer.into_inner()?)?)
    }

    fn masked(&self, mut events: Vec<UsageEvent>) -> Vec<UsageEvent> {
        for e in &mut events {
            e.api_key = mask_key(&e.api_key);
        }
        events
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(allowed: bool) -> UsageEvent {
        UsageEvent {
            timestamp: Utc::now(),
            api_key: "pg_abcdefabcdefabcdef".into(),
            key_name: "test".into(),
            tool: "search".into(),
            credits_charged: if allowed { 1 } else { 0 },
            allowed,
            deny_reason: if allowed { None } else { Some("rate_limited".into()) },
        }
    }

    #[test]
    fn drops_oldest_at_capacity() {
        let meter = Meter::new(2);
        meter.record(event(true));
        meter.record(event(true));
        meter.record(event(false));
        assert_eq!(meter.len(), 2);
    }

    #[test]
    fn export_masks_api_key() {
        let meter = Meter::new(10);
        meter.record(event(true));
        let json = meter.export_json(&UsageQuery::default());
        assert!(!json.contains("pg_abcdefabcdefabcdef"));
    }

    #[test]
    fn query_filters_by_allowed() {
        let meter = Meter::new(10);
        meter.record(event(true));
        meter.record(event(false));
        let denied = meter.query(&UsageQuery {
            allowed: Some(false),
            ..Default::default()
        });
        assert_eq!(denied.len(), 1);
        assert!(!denied[0].allowed);
    }
}
