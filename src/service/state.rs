//! Connection lifecycle state

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of a `ConnectionService`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        }
    }

    /// Explicit transition table
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Disconnecting)
                | (Disconnecting, Idle)
                | (Failed, Idle)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid connection state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Observable state cell
///
/// Every change goes through the transition table; watchers see each
/// accepted value.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        let mut outcome = Err(InvalidTransition {
            from: self.get(),
            to: next,
        });

        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                outcome = Ok(*current);
                *current = next;
                true
            } else {
                outcome = Err(InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });

        if let Ok(previous) = outcome {
            debug!("Connection state: {} -> {}", previous, next);
        }
        outcome
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl FnMut(&ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.subscribe();
        match rx.wait_for(predicate).await {
            Ok(state) => *state,
            // The sender lives in `self`, so the channel cannot close while we wait
            Err(_) => self.get(),
        }
    }
}
