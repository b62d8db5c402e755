//! Control state machine shared by the agent loop, the dashboard and the in-page overlay.
//!
//! ```text
//! running ──pause──▶ paused ──resume──▶ running
//!    │                  │
//!    └──────stop────────┴──────▶ stopped (terminal)
//! ```
//!
//! There is exactly one authoritative value per session, held in a
//! `tokio::sync::watch` channel. Every actor is a client of that channel, so a
//! read after an accepted transition always observes the new phase.
//!
//! A `watch` receiver only sees the latest value, so accepted transitions are
//! also published one by one on a `broadcast` channel for observers that must
//! see each of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::error::{Result, WebEvalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Running,
    Paused,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition request. Identical whether it comes from the dashboard or the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
}

impl ControlCommand {
    /// Phase the command moves the machine into.
    pub fn target(&self) -> Phase {
        match self {
            Self::Pause => Phase::Paused,
            Self::Resume => Phase::Running,
            Self::Stop => Phase::Stopped,
        }
    }
}

/// Who asked for a transition. Used for logging only; all origins share one code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOrigin {
    Dashboard,
    Overlay,
    Agent,
    System,
}

impl ControlOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Overlay => "overlay",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

/// Point-in-time view of the control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub phase: Phase,
    pub since: DateTime<Utc>,
}

impl ControlSnapshot {
    fn now(phase: Phase) -> Self {
        Self {
            phase,
            since: Utc::now(),
        }
    }

    /// The `{paused, stopped}` shape returned to the page by `getAgentState()`.
    pub fn agent_state(&self) -> AgentState {
        AgentState {
            paused: self.phase == Phase::Paused,
            stopped: self.phase == Phase::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub paused: bool,
    pub stopped: bool,
}

/// Outcome of a checkpoint before an automation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Abort,
}

/// One accepted transition. `generation` counts transitions since creation,
/// so an observer can tell which of two snapshots is newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub generation: u64,
    pub snapshot: ControlSnapshot,
}

/// Buffered transitions per observer before it starts lagging.
const TRANSITION_CAPACITY: usize = 64;

/// Handle to the authoritative control state of one session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ControlState {
    tx: Arc<watch::Sender<ControlSnapshot>>,
    generation: Arc<AtomicU64>,
    transitions: broadcast::Sender<Transition>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlState {
    /// Create a control state in the `running` phase.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlSnapshot::now(Phase::Running));
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
            transitions,
        }
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        *self.tx.borrow()
    }

    pub fn phase(&self) -> Phase {
        self.tx.borrow().phase
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlSnapshot> {
        self.tx.subscribe()
    }

    /// Every accepted transition from now on, in the order it was applied.
    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// The current snapshot with its generation, read consistently.
    pub fn current(&self) -> Transition {
        let snap = self.tx.borrow();
        Transition {
            generation: self.generation.load(Ordering::Acquire),
            snapshot: *snap,
        }
    }

    /// Called with the watch write lock held.
    fn publish(&self, snapshot: ControlSnapshot) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.transitions.send(Transition {
            generation,
            snapshot,
        });
    }

    /// Request a transition.
    ///
    /// Requests that target the current phase succeed without changing
    /// anything. Every request after `stopped` fails with `SessionTerminated`.
    pub fn request(
        &self,
        command: ControlCommand,
        origin: ControlOrigin,
    ) -> Result<ControlSnapshot> {
        let target = command.target();
        let mut outcome = Err(WebEvalError::SessionTerminated);

        let changed = self.tx.send_if_modified(|snap| match snap.phase {
            Phase::Stopped => false,
            current if current == target => {
                outcome = Ok(*snap);
                false
            }
            _ => {
                *snap = ControlSnapshot::now(target);
                outcome = Ok(*snap);
                self.publish(*snap);
                true
            }
        });

        match &outcome {
            Ok(snap) if changed => {
                info!(origin = origin.as_str(), phase = %snap.phase, "Control transition");
            }
            Ok(snap) => {
                debug!(origin = origin.as_str(), phase = %snap.phase, "Control request was a no-op");
            }
            Err(e) => {
                debug!(origin = origin.as_str(), ?command, %e, "Control request rejected");
            }
        }
        outcome
    }

    /// Force the terminal phase. Used by teardown and crash handling; never fails.
    pub fn seal(&self) -> ControlSnapshot {
        self.tx.send_if_modified(|snap| {
            if snap.phase == Phase::Stopped {
                false
            } else {
                *snap = ControlSnapshot::now(Phase::Stopped);
                self.publish(*snap);
                true
            }
        });
        self.snapshot()
    }

    /// Suspend while paused.
    ///
    /// Wakes on every transition and re-checks at least every `poll`, so a
    /// missed wake-up can delay the caller by one interval at most.
    pub async fn wait_runnable(&self, poll: Duration) -> Decision {
        let mut rx = self.tx.subscribe();
        loop {
            let phase = rx.borrow_and_update().phase;
            match phase {
                Phase::Running => return Decision::Proceed,
                Phase::Stopped => return Decision::Abort,
                Phase::Paused => {}
            }
            tokio::select! {
                res = rx.changed() => {
                    if res.is_err() {
                        return Decision::Abort;
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
