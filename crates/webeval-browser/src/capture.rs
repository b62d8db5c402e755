//! Turns raw page signals into console and network events.

use std::collections::HashMap;

use webeval_core::events::{ConsoleEvent, NetworkEvent};

/// Method recorded for a response whose request was never seen.
const UNKNOWN_METHOD: &str = "UNKNOWN";

struct PendingRequest {
    order: u64,
    method: String,
    url: String,
    resource_type: Option<String>,
}

/// Matches requests to their responses by request id.
///
/// A request is recorded once, when its outcome is known. Requests still
/// pending when the session ends are flushed without a status.
#[derive(Default)]
pub struct NetworkTracker {
    pending: HashMap<String, PendingRequest>,
    next_order: u64,
}

impl NetworkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(
        &mut self,
        id: String,
        method: String,
        url: String,
        resource_type: Option<String>,
    ) {
        let order = self.next_order;
        self.next_order += 1;
        // A redirect reuses the request id; the latest hop wins.
        self.pending.insert(
            id,
            PendingRequest {
                order,
                method,
                url,
                resource_type,
            },
        );
    }

    pub fn response(
        &mut self,
        id: &str,
        url: String,
        status: u16,
        resource_type: Option<String>,
    ) -> NetworkEvent {
        match self.pending.remove(id) {
            Some(req) => NetworkEvent {
                method: req.method,
                url: req.url,
                status: Some(status),
                resource_type: req.resource_type.or(resource_type),
                failure: None,
            },
            None => NetworkEvent {
                method: UNKNOWN_METHOD.to_string(),
                url,
                status: Some(status),
                resource_type,
                failure: None,
            },
        }
    }

    /// `None` for failures of requests this tracker never saw.
    pub fn failed(&mut self, id: &str, error: String) -> Option<NetworkEvent> {
        self.pending.remove(id).map(|req| NetworkEvent {
            method: req.method,
            url: req.url,
            status: None,
            resource_type: req.resource_type,
            failure: Some(error),
        })
    }

    /// Drain every outstanding request in the order it was issued.
    pub fn flush(&mut self) -> Vec<NetworkEvent> {
        let mut pending: Vec<PendingRequest> = self.pending.drain().map(|(_, r)| r).collect();
        pending.sort_by_key(|r| r.order);
        pending
            .into_iter()
            .map(|req| NetworkEvent {
                method: req.method,
                url: req.url,
                status: None,
                resource_type: req.resource_type,
                failure: None,
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Normalize a console call into an event.
pub fn console_event(level: &str, text: String, location: Option<String>) -> ConsoleEvent {
    let level = match level {
        "warn" => "warning".to_string(),
        other => other.to_ascii_lowercase(),
    };
    ConsoleEvent {
        level,
        text,
        location,
    }
}
