//! HTTP API: webhook intake, sync triggers, and the background dispatcher wiring.

pub mod app;
pub mod middleware;
