//! Core types, config, errors, control state and event bus for webeval.

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod protocol;
pub mod report;
pub mod session;
