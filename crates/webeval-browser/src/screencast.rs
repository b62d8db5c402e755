//! Latest-frame-wins screencast publication.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use webeval_core::config::ScreencastFormat;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub frame_id: u64,
    pub format: ScreencastFormat,
    /// Base64 image data as delivered by the browser.
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

/// Holds only the most recent frame. Publishing never waits on observers;
/// a slow observer simply sees fewer frames.
pub struct ScreencastRelay {
    format: ScreencastFormat,
    next_id: AtomicU64,
    tx: watch::Sender<Option<Arc<Frame>>>,
}

impl ScreencastRelay {
    pub fn new(format: ScreencastFormat) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            format,
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    pub fn publish(&self, data: String) -> u64 {
        let frame_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tx.send_replace(Some(Arc::new(Frame {
            frame_id,
            format: self.format,
            data,
            timestamp: Utc::now(),
        })));
        frame_id
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.tx.subscribe()
    }

    pub fn published(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}
