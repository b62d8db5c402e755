//! Dashboard server for live observation and control.
//!
//! Hosts the WebSocket endpoint, follows the active browser session and
//! pushes its events, control transitions and screencast frames to every
//! connected observer. Observers send pause/resume/stop commands back over
//! the same socket.

pub mod connection;
pub mod events;
pub mod relay;
pub mod server;
pub mod state;

pub use server::start_dashboard;
pub use state::DashboardState;
