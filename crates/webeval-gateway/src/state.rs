//! Dashboard shared state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};

use webeval_browser::BrowserSession;
use webeval_browser::screencast::Frame;
use webeval_core::config::Config;
use webeval_core::events::EventFilter;

/// Shared dashboard state accessible from all connections and the relay.
pub struct DashboardState {
    pub config: Arc<Config>,
    pub sessions: Arc<BrowserSession>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    frames: watch::Sender<Option<Arc<Frame>>>,
}

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    pub event_tx: mpsc::UnboundedSender<String>,
}

impl DashboardState {
    pub fn new(sessions: Arc<BrowserSession>) -> Self {
        let (frames, _rx) = watch::channel(None);
        Self {
            config: sessions.config().clone(),
            sessions,
            connections: RwLock::new(HashMap::new()),
            frames,
        }
    }

    /// Which recorded events observers are shown.
    pub fn event_filter(&self) -> EventFilter {
        if self.config.hide_static_assets() {
            EventFilter::Default
        } else {
            EventFilter::All
        }
    }

    /// Replace the latest screencast frame. Never waits on observers.
    pub fn publish_frame(&self, frame: Option<Arc<Frame>>) {
        self.frames.send_replace(frame);
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.frames.borrow().clone()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.frames.subscribe()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
