//! Frame broadcasting to all connected dashboard clients.

use std::sync::Arc;

use tracing::{debug, error};

use webeval_core::protocol::ServerFrame;

use crate::state::DashboardState;

/// Broadcast a frame to all connected clients. Returns how many received it.
pub async fn broadcast_frame(state: &Arc<DashboardState>, frame: &ServerFrame) -> usize {
    let msg = match frame.to_json() {
        Ok(m) => m,
        Err(e) => {
            error!(%e, "Failed to serialize frame");
            return 0;
        }
    };

    let connections = state.connections.read().await;
    let mut sent = 0;
    for conn in connections.values() {
        if conn.event_tx.send(msg.clone()).is_ok() {
            sent += 1;
        } else {
            debug!(conn_id = %conn.conn_id, "Connection queue closed");
        }
    }
    sent
}
