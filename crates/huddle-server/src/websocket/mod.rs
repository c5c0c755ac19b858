//! WebSocket transport for group channels.

pub mod session;

pub use session::run_channel_session;
