//! Connection health and error statistics

use super::ConnectionState;
use crate::config::TransportKind;
use crate::error::{ConnectionError, ErrorCategory, ErrorReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Snapshot of a service's connection health
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorReport>,
    pub error_counts: BTreeMap<ErrorCategory, u64>,
}

/// Mutable health bookkeeping owned by the service
#[derive(Debug, Default)]
pub(crate) struct HealthTracker {
    session_id: Option<Uuid>,
    transport: Option<TransportKind>,
    connected_since: Option<DateTime<Utc>>,
    last_error: Option<ErrorReport>,
    error_counts: BTreeMap<ErrorCategory, u64>,
}

impl HealthTracker {
    pub fn mark_connected(&mut self, session_id: Uuid, transport: TransportKind) {
        self.session_id = Some(session_id);
        self.transport = Some(transport);
        self.connected_since = Some(Utc::now());
    }

    pub fn mark_disconnected(&mut self) {
        self.session_id = None;
        self.transport = None;
        self.connected_since = None;
    }

    pub fn record_error(&mut self, error: &ConnectionError) {
        *self.error_counts.entry(error.category()).or_insert(0) += 1;
        self.last_error = Some(error.report());
    }

    pub fn error_counts(&self) -> BTreeMap<ErrorCategory, u64> {
        self.error_counts.clone()
    }

    pub fn snapshot(&self, state: ConnectionState) -> ConnectionHealth {
        ConnectionHealth {
            state,
            connected: state == ConnectionState::Connected,
            session_id: self.session_id,
            transport: self.transport,
            connected_since: self.connected_since,
            last_error: self.last_error.clone(),
            error_counts: self.error_counts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_counted_per_category() {
        let mut tracker = HealthTracker::default();
        tracker.record_error(&ConnectionError::Busy);
        tracker.record_error(&ConnectionError::AlreadyConnected);
        tracker.record_error(&ConnectionError::Cancelled);

        let counts = tracker.error_counts();
        assert_eq!(counts.get(&ErrorCategory::InvalidState), Some(&2));
        assert_eq!(counts.get(&ErrorCategory::Cancelled), Some(&1));

        let health = tracker.snapshot(ConnectionState::Idle);
        assert!(!health.connected);
        assert_eq!(
            health.last_error.map(|report| report.category),
            Some(ErrorCategory::Cancelled)
        );
    }

    #[test]
    fn test_connected_since_cleared_on_disconnect() {
        let mut tracker = HealthTracker::default();
        let session_id = Uuid::new_v4();
        tracker.mark_connected(session_id, TransportKind::Http);
        let health = tracker.snapshot(ConnectionState::Connected);
        assert!(health.connected);
        assert_eq!(health.session_id, Some(session_id));
        assert_eq!(health.transport, Some(TransportKind::Http));
        assert!(health.connected_since.is_some());

        tracker.mark_disconnected();
        let health = tracker.snapshot(ConnectionState::Idle);
        assert!(health.connected_since.is_none());
        assert!(health.transport.is_none());
        assert!(health.session_id.is_none());
    }
}
