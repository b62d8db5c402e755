//! Dashboard WebSocket wire protocol.
//!
//! Clients send [`CommandFrame`]s; the server pushes [`ServerFrame`]s. Every
//! frame is one JSON text message tagged by `"type"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::control::{ControlCommand, ControlSnapshot};
use crate::error::WebEvalError;
use crate::events::Event;
use crate::session::SessionInfo;

pub const PROTOCOL_VERSION: u32 = 1;

/// Inbound control request, e.g. `{"type":"pause","id":"c1"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    #[serde(rename = "type")]
    pub command: ControlCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl From<&WebEvalError> for ErrorShape {
    fn from(e: &WebEvalError) -> Self {
        Self {
            code: e.error_code().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection: current session and its backlog.
    Hello {
        version: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<SessionInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<ControlSnapshot>,
        #[serde(default)]
        events: Vec<Event>,
        #[serde(default)]
        truncated: u64,
    },
    /// Reply to a [`CommandFrame`].
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<ControlSnapshot>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },
    /// One recorded event, flattened: `{"type":"event","sequence":..,"kind":..}`.
    Event {
        #[serde(flatten)]
        event: Event,
    },
    State {
        #[serde(flatten)]
        state: ControlSnapshot,
    },
    /// Latest screencast frame. `data` is base64 as delivered by the browser.
    Frame {
        frame_id: u64,
        format: String,
        data: String,
        timestamp: DateTime<Utc>,
    },
    /// Session lifecycle change. `report` is set once the session has ended.
    Session {
        session: SessionInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        report: Option<String>,
    },
}

impl ServerFrame {
    pub fn ack_ok(id: Option<String>, state: ControlSnapshot) -> Self {
        Self::Ack {
            id,
            ok: true,
            state: Some(state),
            error: None,
        }
    }

    pub fn ack_err(id: Option<String>, error: ErrorShape) -> Self {
        Self::Ack {
            id,
            ok: false,
            state: None,
            error: Some(error),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlState;

    #[test]
    fn test_command_frame_parse() {
        let frame: CommandFrame = serde_json::from_str(r#"{"type":"stop","id":"c7"}"#).unwrap();
        assert_eq!(frame.command, ControlCommand::Stop);
        assert_eq!(frame.id.as_deref(), Some("c7"));

        let frame: CommandFrame = serde_json::from_str(r#"{"type":"resume"}"#).unwrap();
        assert_eq!(frame.command, ControlCommand::Resume);
        assert!(frame.id.is_none());
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(serde_json::from_str::<CommandFrame>(r#"{"type":"navigate"}"#).is_err());
    }

    #[test]
    fn test_ack_error_shape() {
        let frame = ServerFrame::ack_err(
            Some("c1".into()),
            ErrorShape::from(&WebEvalError::SessionTerminated),
        );
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "session_terminated");
        assert!(json.get("state").is_none());
    }

    #[test]
    fn test_state_frame() {
        let frame = ServerFrame::State {
            state: ControlState::new().snapshot(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["phase"], "running");
        assert!(json["since"].is_string());
    }

    #[test]
    fn test_event_frame_is_flat() {
        let bus = crate::events::EventBus::new(4);
        bus.record(crate::events::EventPayload::Step(crate::events::StepEvent {
            index: 1,
            action: "click".into(),
            target: "#go".into(),
            outcome: None,
        }));
        let frame = ServerFrame::Event {
            event: bus.snapshot()[0].clone(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["kind"], "step");
        assert_eq!(json["payload"]["target"], "#go");
    }
}
