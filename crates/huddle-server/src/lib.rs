//! # huddle-server
//!
//! WebSocket transport adapter for live group channels.
//!
//! - `GET /groups/{group_id}/participants/{participant_id}/channel`:
//!   upgrades for an active group member and runs a channel session
//!   against the group's dispatcher
//! - `GET /health`: uptime and live group count
//! - Graceful shutdown via `CancellationToken`
//!
//! This crate ships no executable; an embedding application calls
//! [`serve`] or builds a [`HuddleServer`] itself.

#![deny(unsafe_code)]

pub mod errors;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use errors::{Result, ServerError};
pub use server::{AppState, HuddleServer, open_store, serve};
pub use shutdown::ShutdownCoordinator;
