//! Activity tracking
//!
//! Rolling views of who is using the system and how it is failing: distinct
//! active users over the last five minutes, request rate over the last
//! minute, and a bounded ring of recent errors with identical messages
//! grouped over a 24-hour window.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Window for counting a user as active
const ACTIVE_WINDOW: i64 = 5 * 60;

/// Window for the rolling request rate, seconds
const RATE_WINDOW: i64 = 60;

/// Error ring capacity
const ERROR_RING: usize = 100;

/// Window within which identical error messages are grouped
const ERROR_GROUP_WINDOW: i64 = 24 * 60 * 60;

/// One grouped error
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    /// Error message
    pub message: String,
    /// Occurrences grouped into this entry
    pub count: u64,
    /// First occurrence
    pub first_seen: DateTime<Utc>,
    /// Latest occurrence
    pub last_seen: DateTime<Utc>,
}

/// Activity summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    /// Distinct users seen within the active window
    pub active_users: usize,
    /// Requests within the rate window
    pub requests_per_minute: usize,
    /// Recent errors, newest last
    pub recent_errors: Vec<ErrorEntry>,
}

/// Rolling activity tracker
pub struct ActivityTracker {
    users: DashMap<String, DateTime<Utc>>,
    requests: Mutex<VecDeque<DateTime<Utc>>>,
    errors: Mutex<VecDeque<ErrorEntry>>,
}

impl ActivityTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            requests: Mutex::new(VecDeque::new()),
            errors: Mutex::new(VecDeque::with_capacity(ERROR_RING)),
        }
    }

    /// Note a request from a user
    pub fn record_user(&self, user_id: &str) {
        self.users.insert(user_id.to_string(), Utc::now());
    }

    /// Note a request (authenticated or not)
    pub fn record_request(&self) {
        let now = Utc::now();
        let mut requests = self.requests.lock();
        requests.push_back(now);
        let cutoff = now - Duration::seconds(RATE_WINDOW);
        while requests.front().is_some_and(|t| *t < cutoff) {
            requests.pop_front();
        }
    }

    /// Note an error; identical messages within 24h fold into one entry
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        let now = Utc::now();
        let mut errors = self.errors.lock();

        let grouped = errors.iter_mut().rev().find(|e| {
            e.message == message && (now - e.last_seen).num_seconds() < ERROR_GROUP_WINDOW
        });
        match grouped {
            Some(entry) => {
                entry.count += 1;
                entry.last_seen = now;
            }
            None => {
                if errors.len() == ERROR_RING {
                    errors.pop_front();
                }
                errors.push_back(ErrorEntry {
                    message,
                    count: 1,
                    first_seen: now,
                    last_seen: now,
                });
            }
        }
    }

    /// Current activity summary
    pub fn snapshot(&self) -> ActivitySnapshot {
        let now = Utc::now();
        let active_cutoff = now - Duration::seconds(ACTIVE_WINDOW);
        self.users.retain(|_, last_seen| *last_seen >= active_cutoff);

        let rate_cutoff = now - Duration::seconds(RATE_WINDOW);
        let requests_per_minute = self
            .requests
            .lock()
            .iter()
            .filter(|t| **t >= rate_cutoff)
            .count();

        ActivitySnapshot {
            active_users: self.users.len(),
            requests_per_minute,
            recent_errors: self.errors.lock().iter().cloned().collect(),
        }
    }

    /// Drop all tracked state
    pub fn reset(&self) {
        self.users.clear();
        self.requests.lock().clear();
        self.errors.lock().clear();
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}
