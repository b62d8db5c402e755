use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebEvalError {
    #[error("A session is already running ({session_id})")]
    AlreadyRunning { session_id: String },

    #[error("Session terminated: no further control transitions are accepted")]
    SessionTerminated,

    #[error("Browser session crashed: {0}")]
    SessionCrashed(String),

    #[error("Overlay injection failed: {0}")]
    InjectionFailure(String),

    #[error("Event bus retention cap ({cap}) reached, {truncated} events truncated")]
    EventBusOverflow { cap: usize, truncated: u64 },

    #[error("No active session")]
    NoSession,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WebEvalError {
    /// Stable error code used in dashboard acknowledgements and in-page rejections.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "already_running",
            Self::SessionTerminated => "session_terminated",
            Self::SessionCrashed(_) => "session_crashed",
            Self::InjectionFailure(_) => "injection_failure",
            Self::EventBusOverflow { .. } => "event_bus_overflow",
            Self::NoSession => "no_session",
            Self::Config(_) => "config_error",
            Self::Browser(_) => "browser_error",
            Self::Io(_) | Self::Json(_) | Self::Other(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, WebEvalError>;
