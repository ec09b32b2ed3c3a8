//! Bounded history of successful logins
//!
//! `/login_history` reads each server's auth log; this in-memory copy answers for a
//! server whose log cannot be read right now.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::event::{EventKind, SecurityEvent};

pub const LOGIN_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRecord {
    pub server: String,
    pub user: Option<String>,
    pub ip: String,
    pub hostname: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LoginRecord {
    /// `None` unless the event is a successful login
    pub fn from_event(event: &SecurityEvent) -> Option<Self> {
        (event.kind == EventKind::SshLoginSuccess).then(|| Self {
            server: event.server_name().to_string(),
            user: event.user.clone(),
            ip: event.subject.clone(),
            hostname: event.hostname.clone(),
            timestamp: event.timestamp,
        })
    }
}

pub struct LoginHistory {
    capacity: usize,
    records: Mutex<VecDeque<LoginRecord>>,
}

impl Default for LoginHistory {
    fn default() -> Self {
        Self::with_capacity(LOGIN_HISTORY_CAPACITY)
    }
}

impl LoginHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Remember the event if it is a successful login
    pub fn record(&self, event: &SecurityEvent) {
        let Some(record) = LoginRecord::from_event(event) else {
            return;
        };

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent `limit` logins on `server`, newest first
    pub fn recent_on(&self, server: &str, limit: usize) -> Vec<LoginRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .rev()
            .filter(|record| record.server == server)
            .take(limit)
            .cloned()
            .collect()
    }
}
