//! TermWeave server: Axum HTTP + WebSocket front end plus the session reaper.

mod reaper;
mod web_server;

pub use web_server::run_server;
