//! Ordered merge log for console, network and agent-step events.
//!
//! Producers call [`EventBus::record`] from any task. Sequence numbers and
//! timestamps are assigned under one lock, so the log order, the sequence
//! order and the real-time order of `record` calls always agree.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::WebEvalError;

/// Live subscribers that fall further behind than this are resynchronized from the log.
const BROADCAST_CAPACITY: usize = 1024;

/// Kind discriminator, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Console,
    Network,
    Step,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEvent {
    pub level: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub method: String,
    pub url: String,
    /// HTTP status; `None` if the request failed or never completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub index: u32,
    pub action: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    Console(ConsoleEvent),
    Network(NetworkEvent),
    Step(StepEvent),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Console(_) => EventKind::Console,
            Self::Network(_) => EventKind::Network,
            Self::Step(_) => EventKind::Step,
        }
    }
}

/// A sequenced, timestamped event. Serializes as `{sequence, timestamp, kind, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Console errors, failed requests, and 4xx/5xx responses.
    pub fn is_problem(&self) -> bool {
        match &self.payload {
            EventPayload::Console(c) => c.level == "error" || c.level == "assert",
            EventPayload::Network(n) => {
                n.failure.is_some() || n.status.is_some_and(|s| s >= 400)
            }
            EventPayload::Step(_) => false,
        }
    }
}

const STATIC_EXTENSIONS: &[&str] = &[
    ".js", ".css", ".woff", ".woff2", ".ttf", ".eot", ".svg", ".png", ".jpg", ".jpeg", ".gif",
    ".ico", ".map",
];

/// Whether a URL looks like a static asset (library code, styles, fonts, images).
pub fn is_static_asset(url: &str) -> bool {
    if url.contains("/api/") || url.contains("/graphql") {
        return false;
    }
    if url.contains("/node_modules/") {
        return true;
    }
    STATIC_EXTENSIONS
        .iter()
        .any(|ext| url.ends_with(ext) || url.contains(&format!("{ext}?")))
}

/// Built-in views over the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    All,
    /// Everything except successful (2xx/3xx) static-asset requests.
    #[default]
    Default,
    Console,
    Network,
    Steps,
    Problems,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Default => match &event.payload {
                EventPayload::Network(n) => {
                    let ok = n.status.is_some_and(|s| (200..400).contains(&s));
                    !(ok && is_static_asset(&n.url))
                }
                _ => true,
            },
            Self::Console => event.kind() == EventKind::Console,
            Self::Network => event.kind() == EventKind::Network,
            Self::Steps => event.kind() == EventKind::Step,
            Self::Problems => event.is_problem(),
        }
    }
}

/// A finite, restartable view over a point-in-time copy of the log.
///
/// Iterating it does not touch the bus; every call to [`iter`](Self::iter)
/// starts again from the beginning of the same copy.
pub struct FilteredEvents<P> {
    events: Arc<[Event]>,
    predicate: P,
}

impl<P> FilteredEvents<P>
where
    P: Fn(&Event) -> bool,
{
    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().filter(move |e| (self.predicate)(e))
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

impl<'a, P> IntoIterator for &'a FilteredEvents<P>
where
    P: Fn(&Event) -> bool,
{
    type Item = &'a Event;
    type IntoIter = Box<dyn Iterator<Item = &'a Event> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

struct BusLog {
    next_sequence: u64,
    events: VecDeque<Event>,
    truncated: u64,
}

/// The ordered merge point for all event producers of one session.
pub struct EventBus {
    cap: usize,
    log: Mutex<BusLog>,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus that retains at most `cap` events.
    pub fn new(cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            cap: cap.max(1),
            log: Mutex::new(BusLog {
                next_sequence: 1,
                events: VecDeque::new(),
                truncated: 0,
            }),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusLog> {
        // A panic while holding the lock cannot leave the log half-written.
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event, returning its sequence number.
    ///
    /// When the retention cap is hit the oldest event is evicted and counted;
    /// nothing is ever dropped without a trace.
    pub fn record(&self, payload: EventPayload) -> u64 {
        let event = {
            let mut log = self.lock();
            let event = Event {
                sequence: log.next_sequence,
                timestamp: Utc::now(),
                payload,
            };
            log.next_sequence += 1;
            if log.events.len() >= self.cap {
                log.events.pop_front();
                log.truncated += 1;
                if log.truncated == 1 {
                    let overflow = WebEvalError::EventBusOverflow {
                        cap: self.cap,
                        truncated: log.truncated,
                    };
                    warn!(%overflow, "Truncating oldest events");
                }
            }
            log.events.push_back(event.clone());
            // Sent under the lock so subscribers receive events in sequence order.
            let _ = self.tx.send(event.clone());
            event
        };
        debug!(sequence = event.sequence, kind = ?event.kind(), "Event recorded");
        event.sequence
    }

    /// Consistent point-in-time copy, in sequence order.
    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().events.iter().cloned().collect()
    }

    /// Events with a sequence greater than `after`.
    pub fn since(&self, after: u64) -> Vec<Event> {
        let log = self.lock();
        let start = log.events.partition_point(|e| e.sequence <= after);
        log.events.range(start..).cloned().collect()
    }

    /// Restartable filtered view over the current contents.
    pub fn filter<P>(&self, predicate: P) -> FilteredEvents<P>
    where
        P: Fn(&Event) -> bool,
    {
        FilteredEvents {
            events: self.snapshot().into(),
            predicate,
        }
    }

    /// Shorthand for one of the built-in views.
    pub fn view(&self, filter: EventFilter) -> FilteredEvents<impl Fn(&Event) -> bool> {
        self.filter(move |e| filter.matches(e))
    }

    /// Snapshot plus the number of events evicted so far, taken atomically.
    pub fn snapshot_with_truncation(&self) -> (Vec<Event>, u64) {
        let log = self.lock();
        (log.events.iter().cloned().collect(), log.truncated)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn truncated(&self) -> u64 {
        self.lock().truncated
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_sequence(&self) -> u64 {
        self.lock().next_sequence - 1
    }
}
