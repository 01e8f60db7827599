//! Bridges MQTT sensor telemetry to live WebSocket dashboards while recording
//! every reading in SQLite.
//!
//! ```text
//! MQTT delivery thread --(bounded channel)--> router task --> sink (SQLite)
//!                                                  \-------> hub --> per-consumer queue --> socket
//! ```

pub mod alerts;
pub mod config;
pub mod db;
pub mod errors;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod registry;
pub mod rest;
pub mod router;
pub mod server;
pub mod validate;
pub mod ws;
