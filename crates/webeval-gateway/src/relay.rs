//! Follows the active session and forwards what it produces to observers.
//!
//! Delivery is at-least-once per connection: an event can arrive both in a
//! connection's `hello` backlog and as a live frame. Clients drop any event
//! whose sequence they have already seen.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webeval_browser::SessionHandle;
use webeval_core::control::Transition;
use webeval_core::events::{Event, EventFilter};
use webeval_core::protocol::ServerFrame;

use crate::events::broadcast_frame;
use crate::state::DashboardState;

/// Spawn the relay. It runs until `cancel` fires.
pub fn spawn_relay(
    state: Arc<DashboardState>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_relay(state, cancel))
}

pub async fn run_relay(state: Arc<DashboardState>, cancel: CancellationToken) {
    let mut sessions = state.sessions.subscribe();
    loop {
        let current = sessions.borrow_and_update().clone();
        if let Some(handle) = current {
            let session_id = handle.id();
            info!(%session_id, "Relaying session");
            broadcast_frame(
                &state,
                &ServerFrame::Session {
                    session: handle.info(),
                    report: None,
                },
            )
            .await;

            if !follow(&state, &handle, &mut sessions, &cancel).await {
                return;
            }

            // The registry only lets go of a session once teardown has built
            // its report, so this returns without touching the browser.
            let report = handle.teardown().await;
            state.publish_frame(None);
            broadcast_frame(
                &state,
                &ServerFrame::Session {
                    session: report.session.clone(),
                    report: Some(report.render()),
                },
            )
            .await;
            debug!(%session_id, "Session relay finished");
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = sessions.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Forward one session until it leaves the registry. Returns false when the
/// relay itself should stop.
async fn follow(
    state: &Arc<DashboardState>,
    handle: &SessionHandle,
    sessions: &mut watch::Receiver<Option<SessionHandle>>,
    cancel: &CancellationToken,
) -> bool {
    let bus = handle.events().clone();
    let mut events = bus.subscribe();
    let mut transitions = handle.control().transitions();
    let mut frames = handle.screencast().subscribe();
    let filter = state.event_filter();

    // Catch up on whatever was recorded before the session was registered.
    let mut last_sent = forward_events(state, filter, bus.since(0), 0).await;
    let current = handle.control().current();
    let mut last_generation = current.generation;
    broadcast_frame(
        state,
        &ServerFrame::State {
            state: current.snapshot,
        },
    )
    .await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = sessions.changed() => {
                if changed.is_err() {
                    return false;
                }
                let still_current = sessions
                    .borrow_and_update()
                    .as_ref()
                    .is_some_and(|h| h.id() == handle.id());
                if !still_current {
                    // Pick up anything recorded during teardown.
                    forward_events(state, filter, bus.since(last_sent), last_sent).await;
                    while let Ok(transition) = transitions.try_recv() {
                        forward_transition(state, transition, &mut last_generation).await;
                    }
                    return true;
                }
            }
            received = events.recv() => match received {
                Ok(event) => {
                    if event.sequence > last_sent {
                        last_sent = forward_events(state, filter, vec![event], last_sent).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session_id = %handle.id(), skipped, "Relay lagged, resyncing from the bus");
                    last_sent = forward_events(state, filter, bus.since(last_sent), last_sent).await;
                }
                Err(broadcast::error::RecvError::Closed) => return true,
            },
            received = transitions.recv() => {
                let transition = match received {
                    Ok(transition) => transition,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %handle.id(), skipped, "Relay lagged on control transitions");
                        handle.control().current()
                    }
                    Err(broadcast::error::RecvError::Closed) => return true,
                };
                forward_transition(state, transition, &mut last_generation).await;
            }
            Ok(()) = frames.changed() => {
                let frame = frames.borrow_and_update().clone();
                state.publish_frame(frame);
            }
        }
    }
}

/// Broadcast a control transition unless an earlier frame already covered it.
async fn forward_transition(
    state: &Arc<DashboardState>,
    transition: Transition,
    last_generation: &mut u64,
) {
    if transition.generation <= *last_generation {
        return;
    }
    *last_generation = transition.generation;
    broadcast_frame(
        state,
        &ServerFrame::State {
            state: transition.snapshot,
        },
    )
    .await;
}

/// Broadcast the events that pass `filter`. Returns the highest sequence seen.
async fn forward_events(
    state: &Arc<DashboardState>,
    filter: EventFilter,
    events: Vec<Event>,
    mut last_sent: u64,
) -> u64 {
    for event in events {
        last_sent = last_sent.max(event.sequence);
        if filter.matches(&event) {
            broadcast_frame(state, &ServerFrame::Event { event }).await;
        }
    }
    last_sent
}
