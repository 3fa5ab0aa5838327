//! Externally observable server state.
//!
//! Lifecycle events from the pool and the coordinator are aggregated into a
//! stream of [`StateEvent`] records. Consecutive events carrying the same
//! coarse [`ServerState`] are deduplicated to avoid flapping; the situation
//! field is deliberately not part of that comparison.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Coarse server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Serving normally.
    Operating,
    /// Something went wrong with a request or a worker.
    Failing,
    /// A child process was deliberately stopped.
    Stopping,
    /// The server fulfilled a stop call.
    Stopped,
}

/// What happened. This is a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Situation {
    ServerStarted,
    StoppedChildProcess,
    WasmMissing,
    DisasterlyCrashed,
    RespawnedAfterDisaster,
    HtmlRendered,
    HtmlNotRendered,
    RequestFailed,
    FulfilledStopCall,
}

impl Situation {
    /// The coarse state this situation maps to.
    pub fn state(self) -> ServerState {
        match self {
            Self::ServerStarted | Self::HtmlRendered | Self::RespawnedAfterDisaster => {
                ServerState::Operating
            }
            Self::WasmMissing
            | Self::DisasterlyCrashed
            | Self::HtmlNotRendered
            | Self::RequestFailed => ServerState::Failing,
            Self::StoppedChildProcess => ServerState::Stopping,
            Self::FulfilledStopCall => ServerState::Stopped,
        }
    }
}

/// One record in the state stream.
#[derive(Debug, Clone, Serialize)]
pub struct StateEvent {
    /// Coarse state after this event.
    pub state: ServerState,
    /// What happened.
    pub situation: Situation,
    /// Human-readable detail.
    pub description: String,
}

/// Aggregates lifecycle events into a deduplicated broadcast stream.
pub struct StateReporter {
    last_state: Mutex<Option<ServerState>>,
    events: broadcast::Sender<StateEvent>,
}

impl StateReporter {
    /// Create a reporter with a modest subscriber buffer.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            last_state: Mutex::new(None),
            events,
        }
    }

    /// Subscribe to the state stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Record a situation. Returns `false` when the event was suppressed
    /// because the coarse state did not change.
    pub fn report(&self, situation: Situation, description: impl Into<String>) -> bool {
        let state = situation.state();
        {
            let mut last = self.last_state.lock().expect("state reporter lock poisoned");
            if *last == Some(state) {
                debug!(?state, ?situation, "state unchanged; event suppressed");
                return false;
            }
            *last = Some(state);
        }

        let event = StateEvent {
            state,
            situation,
            description: description.into(),
        };
        info!(
            state = ?event.state,
            situation = ?event.situation,
            description = %event.description,
            "server state"
        );
        let _ = self.events.send(event);
        true
    }
}

impl Default for StateReporter {
    fn default() -> Self {
        Self::new()
    }
}
