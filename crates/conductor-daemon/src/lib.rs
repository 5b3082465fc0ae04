//! conductor-daemon
//!
//! HTTP surface over `conductor-backend`: status long-poll, query dispatch,
//! pool resizing, and a small static file server. `main.rs` is the thin
//! entry point; route handlers and shared state live here so the scenario
//! tests in `tests/` can build the router directly.

pub mod routes;
pub mod state;
