//! Audit events emitted by the accounting engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of a structural accounting event, for auditing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountingEvent {
    pub event_type: String, // e.g. "account_created", "upload_aborted"
    pub account: String,
    pub subject: String, // path, transaction id, or other affected entity
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

/// Bounded in-memory event log with newest-first retrieval.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventLog {
    events: Vec<AccountingEvent>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
        }
    }

    pub fn emit(&mut self, event_type: &str, account: &str, subject: &str, details: String) {
        self.events.push(AccountingEvent {
            event_type: event_type.to_string(),
            account: account.to_string(),
            subject: subject.to_string(),
            timestamp: Utc::now(),
            details,
        });
        if self.capacity > 0 && self.events.len() > self.capacity {
            let excess = self.events.len() - self.capacity;
            self.events.drain(..excess);
        }
    }

    /// Latest events first, optionally filtered by account and event type.
    pub fn query(
        &self,
        account: Option<&str>,
        event_type: Option<&str>,
        limit: usize,
    ) -> Vec<AccountingEvent> {
        self.events
            .iter()
            .rev()
            .filter(|event| {
                account.map_or(true, |a| event.account == a)
                    && event_type.map_or(true, |t| event.event_type == t)
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_filters_and_limits() {
        let mut log = EventLog::new(16);
        log.emit("account_created", "a", "a", String::new());
        log.emit("account_created", "b", "b", String::new());
        log.emit("upload_aborted", "a", "/tmp/t", "disk space violated".to_string());

        assert_eq!(log.query(Some("a"), None, 10).len(), 2);
        assert_eq!(log.query(None, Some("account_created"), 10).len(), 2);
        assert_eq!(log.query(None, None, 1).len(), 1);
        // Newest first
        assert_eq!(log.query(None, None, 1)[0].event_type, "upload_aborted");
    }

    #[test]
    fn test_capacity_bound() {
        let mut log = EventLog::new(2);
        log.emit("a", "x", "x", String::new());
        log.emit("b", "x", "x", String::new());
        log.emit("c", "x", "x", String::new());
        let all = log.query(None, None, 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, "c");
    }
}
