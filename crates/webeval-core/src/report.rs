//! End-of-session report assembled from the event log.

use std::fmt::Write as _;

use serde::Serialize;

use crate::control::{ControlSnapshot, Phase};
use crate::events::{Event, EventPayload, NetworkEvent};
use crate::session::{SessionInfo, SessionStatus};

/// Immutable record of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub session: SessionInfo,
    /// Every retained event, in sequence order.
    pub events: Vec<Event>,
    /// Events evicted by the retention cap before the session ended.
    pub truncated: u64,
    pub final_state: ControlSnapshot,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_reason: Option<String>,
}

impl Report {
    /// Derive the status from how the run ended: crash beats stop beats completion.
    pub fn status_for(final_phase: Phase, crash_reason: Option<&str>) -> SessionStatus {
        match (crash_reason, final_phase) {
            (Some(_), _) => SessionStatus::Crashed,
            (None, Phase::Stopped) => SessionStatus::Stopped,
            (None, _) => SessionStatus::Completed,
        }
    }

    /// Human-readable summary in the layout the agent consumes.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Web evaluation report");
        let _ = writeln!(out, "URL: {}", self.session.target_url);
        if let Some(task) = &self.session.task {
            let _ = writeln!(out, "Task: {task}");
        }
        let _ = writeln!(
            out,
            "Session: {} (started {})",
            self.session.id,
            self.session.started_at.to_rfc3339()
        );
        if self.truncated > 0 {
            let _ = writeln!(out, "[{} events truncated]", self.truncated);
        }

        self.render_steps(&mut out);
        self.render_console(&mut out);
        self.render_network(&mut out);
        self.render_timeline(&mut out);

        let _ = writeln!(out);
        match (&self.status, &self.crash_reason) {
            (SessionStatus::Crashed, Some(reason)) => {
                let _ = writeln!(out, "Outcome: crashed ({reason})");
            }
            (status, _) => {
                let _ = writeln!(
                    out,
                    "Outcome: {status} (final control phase: {})",
                    self.final_state.phase
                );
            }
        }
        out
    }

    fn render_steps(&self, out: &mut String) {
        let _ = writeln!(out, "\n## Agent Steps");
        let mut any = false;
        for event in &self.events {
            if let EventPayload::Step(s) = &event.payload {
                any = true;
                let _ = write!(out, "{}. {} {}", s.index, s.action, s.target);
                if let Some(outcome) = &s.outcome {
                    let _ = write!(out, " -> {outcome}");
                }
                let _ = writeln!(out);
            }
        }
        if !any {
            let _ = writeln!(out, "(none)");
        }
    }

    fn render_console(&self, out: &mut String) {
        let _ = writeln!(out, "\n## Console Logs");
        let lines: Vec<String> = self
            .events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Console(c) => Some(format!("[{}] {}", c.level, c.text)),
                _ => None,
            })
            .collect();
        if lines.is_empty() {
            let _ = writeln!(out, "(none)");
            return;
        }
        for (line, count) in collapse_repeats(&lines) {
            if count > 1 {
                let _ = writeln!(out, "{line} (repeated {count} times)");
            } else {
                let _ = writeln!(out, "{line}");
            }
        }
    }

    fn render_network(&self, out: &mut String) {
        let _ = writeln!(out, "\n## Network Requests");
        let mut any = false;
        for event in &self.events {
            if let EventPayload::Network(n) = &event.payload {
                any = true;
                let _ = writeln!(
                    out,
                    "{} {} {}",
                    n.method,
                    display_path(&n.url),
                    network_outcome(n)
                );
            }
        }
        if !any {
            let _ = writeln!(out, "(none)");
        }
    }

    fn render_timeline(&self, out: &mut String) {
        let _ = writeln!(out, "\n## Chronological Timeline");
        for event in &self.events {
            let time = event.timestamp.format("%H:%M:%S%.3f");
            let line = match &event.payload {
                EventPayload::Console(c) => format!("console.{}: {}", c.level, c.text),
                EventPayload::Network(n) => format!(
                    "{} {} -> {}",
                    n.method,
                    display_path(&n.url),
                    network_outcome(n)
                ),
                EventPayload::Step(s) => format!("step {}: {} {}", s.index, s.action, s.target),
            };
            let _ = writeln!(out, "#{} {time} {line}", event.sequence);
        }
    }
}

/// Group consecutive identical lines.
fn collapse_repeats(lines: &[String]) -> Vec<(&str, usize)> {
    let mut out: Vec<(&str, usize)> = Vec::new();
    for line in lines {
        match out.last_mut() {
            Some((prev, count)) if *prev == line.as_str() => *count += 1,
            _ => out.push((line.as_str(), 1)),
        }
    }
    out
}

/// Status code, failure text, or `pending` for a request that never finished.
fn network_outcome(n: &NetworkEvent) -> String {
    match (&n.status, &n.failure) {
        (Some(s), _) => s.to_string(),
        (None, Some(f)) => format!("failed: {f}"),
        (None, None) => "pending".to_string(),
    }
}

/// Strip scheme and host for compact display; falls back to the full URL.
fn display_path(url: &str) -> &str {
    url.split_once("://")
        .and_then(|(_, rest)| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlState;
    use crate::events::{ConsoleEvent, EventBus, StepEvent};

    fn report_from(bus: &EventBus, status: SessionStatus, crash: Option<&str>) -> Report {
        let (events, truncated) = bus.snapshot_with_truncation();
        Report {
            session: SessionInfo::new("http://localhost:3000/app", Some("log in".into())),
            events,
            truncated,
            final_state: ControlState::new().snapshot(),
            status,
            crash_reason: crash.map(str::to_string),
        }
    }

    fn log(bus: &EventBus, text: &str) {
        bus.record(EventPayload::Console(ConsoleEvent {
            level: "log".into(),
            text: text.into(),
            location: None,
        }));
    }

    #[test]
    fn test_status_for() {
        assert_eq!(
            Report::status_for(Phase::Running, None),
            SessionStatus::Completed
        );
        assert_eq!(
            Report::status_for(Phase::Stopped, None),
            SessionStatus::Stopped
        );
        assert_eq!(
            Report::status_for(Phase::Paused, Some("tab crashed")),
            SessionStatus::Crashed
        );
    }

    #[test]
    fn test_console_repeats_collapse() {
        let bus = EventBus::new(100);
        log(&bus, "tick");
        log(&bus, "tick");
        log(&bus, "tick");
        log(&bus, "done");
        log(&bus, "tick");
        let text = report_from(&bus, SessionStatus::Completed, None).render();
        assert!(text.contains("[log] tick (repeated 3 times)"));
        assert!(text.contains("[log] done\n[log] tick\n"));
    }

    #[test]
    fn test_render_sections_and_order() {
        let bus = EventBus::new(100);
        bus.record(EventPayload::Step(StepEvent {
            index: 1,
            action: "navigate".into(),
            target: "/login".into(),
            outcome: Some("ok".into()),
        }));
        bus.record(EventPayload::Network(NetworkEvent {
            method: "POST".into(),
            url: "http://localhost:3000/api/login?x=1".into(),
            status: Some(401),
            resource_type: Some("fetch".into()),
            failure: None,
        }));
        log(&bus, "login failed");

        let text = report_from(&bus, SessionStatus::Completed, None).render();
        let steps = text.find("## Agent Steps").unwrap();
        let console = text.find("## Console Logs").unwrap();
        let network = text.find("## Network Requests").unwrap();
        let timeline = text.find("## Chronological Timeline").unwrap();
        assert!(steps < console && console < network && network < timeline);
        assert!(text.contains("1. navigate /login -> ok"));
        assert!(text.contains("POST /api/login?x=1 401"));
        assert!(text.contains("Task: log in"));

        let first = text.find("#1 ").unwrap();
        let third = text.find("#3 ").unwrap();
        assert!(first < third);
        assert!(text.contains("Outcome: completed"));
    }

    #[test]
    fn test_truncation_marker() {
        let bus = EventBus::new(2);
        for i in 0..5 {
            log(&bus, &format!("line {i}"));
        }
        let report = report_from(&bus, SessionStatus::Completed, None);
        assert_eq!(report.truncated, 3);
        assert!(report.render().contains("[3 events truncated]"));
    }

    #[test]
    fn test_crash_outcome() {
        let bus = EventBus::new(10);
        let text = report_from(&bus, SessionStatus::Crashed, Some("target crashed")).render();
        assert!(text.contains("Outcome: crashed (target crashed)"));
        assert!(text.contains("## Console Logs\n(none)"));
    }

    #[test]
    fn test_network_outcome_agrees_across_sections() {
        let bus = EventBus::new(10);
        bus.record(EventPayload::Network(NetworkEvent {
            method: "GET".into(),
            url: "http://localhost:3000/api/slow".into(),
            status: None,
            resource_type: Some("fetch".into()),
            failure: None,
        }));
        bus.record(EventPayload::Network(NetworkEvent {
            method: "GET".into(),
            url: "http://localhost:3000/api/down".into(),
            status: None,
            resource_type: Some("fetch".into()),
            failure: Some("net::ERR_CONNECTION_REFUSED".into()),
        }));

        let text = report_from(&bus, SessionStatus::Stopped, None).render();
        assert!(text.contains("GET /api/slow pending\n"));
        assert!(text.contains("GET /api/slow -> pending\n"));
        assert!(text.contains("GET /api/down failed: net::ERR_CONNECTION_REFUSED\n"));
        assert!(text.contains("GET /api/down -> failed: net::ERR_CONNECTION_REFUSED\n"));
        assert!(!text.contains("/api/slow -> failed"));
    }

    #[test]
    fn test_display_path() {
        assert_eq!(display_path("https://a.b/c/d?e"), "/c/d?e");
        assert_eq!(display_path("https://a.b"), "https://a.b");
        assert_eq!(display_path("data:image/png"), "data:image/png");
    }
}
