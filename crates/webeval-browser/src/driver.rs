//! Seam between the session manager and the browser automation surface.
//!
//! [`BrowserSession`](crate::BrowserSession) only talks to these traits. The
//! Chromium implementation lives in [`crate::chromium`] behind the `browser`
//! feature; tests plug in a scripted fake.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use webeval_core::config::{BrowserConfig, ScreencastConfig};
use webeval_core::error::Result;

/// Name of the page binding the control bridge calls into.
pub const CONTROL_BINDING: &str = "__webevalControl";

/// Raw signal emitted by a live page, consumed by the session's event pump.
#[derive(Debug, Clone, PartialEq)]
pub enum PageSignal {
    Console {
        level: String,
        text: String,
        location: Option<String>,
    },
    Request {
        id: String,
        method: String,
        url: String,
        resource_type: Option<String>,
    },
    Response {
        id: String,
        url: String,
        status: u16,
        resource_type: Option<String>,
    },
    LoadingFailed {
        id: String,
        error: String,
    },
    /// One screencast frame, base64 encoded. The driver acknowledges it itself.
    Frame {
        data: String,
    },
    /// The in-page bridge called `pauseAgent()` and friends.
    ControlCall {
        id: u64,
        call: String,
    },
    /// The main frame committed a new document.
    Navigated {
        url: String,
    },
    Crashed(String),
}

pub type SignalSender = mpsc::UnboundedSender<PageSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<PageSignal>;

/// Launches (or attaches to) a browser and opens the page a session drives.
#[async_trait]
pub trait BrowserDriver: Send + Sync + 'static {
    /// Short identifier for logs (e.g. "chromium").
    fn name(&self) -> &str;

    /// Open a blank page with all listeners attached. Signals flow into
    /// `signals` until the page is closed.
    async fn launch(&self, config: &BrowserConfig, signals: SignalSender)
    -> Result<Arc<dyn LivePage>>;
}

/// One live page. Only the agent loop navigates or manipulates it.
#[async_trait]
pub trait LivePage: Send + Sync + 'static {
    /// Register the control binding and install `bridge_script` in the
    /// current document and every future one.
    async fn expose_control(&self, bridge_script: &str) -> Result<()>;

    async fn goto(&self, url: &str) -> Result<()>;

    /// Evaluate a script in the main frame and return its JSON result.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// Settle a pending bridge call.
    async fn resolve_call(&self, id: u64, ok: bool, value: serde_json::Value) -> Result<()> {
        let script = format!(
            "window.__webevalResolve && window.__webevalResolve({id}, {ok}, {value})"
        );
        self.evaluate(&script).await.map(|_| ())
    }

    async fn start_screencast(&self, config: &ScreencastConfig) -> Result<()>;

    /// Release the page and, if this driver launched it, the browser.
    async fn close(&self) -> Result<()>;
}
