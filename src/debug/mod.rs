//! Protocol traffic capture
//!
//! [`InstrumentedTransport`] records every message crossing a transport into a
//! shared, bounded [`DebugLog`] that consumers read through snapshots.

pub mod instrumented;
pub mod ring_buffer;

pub use instrumented::InstrumentedTransport;
pub use ring_buffer::RingBuffer;

use crate::sync::MutexExt;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Which way a message travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// What was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    Request,
    Response,
    Notification,
    TransportEvent,
    Error,
}

/// One captured protocol event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub payload: Value,
}

impl DebugEntry {
    pub fn new(direction: Direction, kind: EntryKind, method: Option<&str>, payload: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            kind,
            method: method.map(str::to_string),
            payload,
        }
    }
}

impl fmt::Display for DebugEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Outbound => "->",
            Direction::Inbound => "<-",
        };
        write!(
            f,
            "{} {} {:?} {} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            arrow,
            self.kind,
            self.method.as_deref().unwrap_or("-"),
            self.payload
        )
    }
}

/// Shared handle to the captured traffic
///
/// Cloning yields another handle to the same buffer.
#[derive(Debug, Clone)]
pub struct DebugLog {
    buffer: Arc<Mutex<RingBuffer<DebugEntry>>>,
}

impl DebugLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(RingBuffer::new(capacity))),
        }
    }

    pub fn record(&self, entry: DebugEntry) {
        self.buffer.lock_unpoisoned().push(entry);
    }

    /// Ordered copy of the current entries
    pub fn snapshot(&self) -> Vec<DebugEntry> {
        self.buffer.lock_unpoisoned().to_vec()
    }

    pub fn clear(&self) {
        self.buffer.lock_unpoisoned().clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.lock_unpoisoned().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock_unpoisoned().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock_unpoisoned().capacity()
    }

    pub fn evicted(&self) -> u64 {
        self.buffer.lock_unpoisoned().evicted()
    }
}
