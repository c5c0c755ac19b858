//! # huddle-dispatch
//!
//! Live message routing for groups.
//!
//! - [`GroupDispatcher`]: one actor per live group, fanning presence events
//!   and relayed payloads out to the group's channels
//! - [`GroupDispatcherRegistry`]: process-wide directory, one dispatcher
//!   per group id, created on first use
//! - [`GroupChannel`] / [`GroupChannelRegistry`]: live connection handles
//! - [`GroupActionMsgBuilder`] / [`GroupActionHandler`]: envelope building
//!   and client action processing

#![deny(unsafe_code)]

pub mod action_handler;
pub mod channel;
pub mod channel_registry;
pub mod dispatcher;
pub mod errors;
pub mod msg_builder;
pub mod registry;

pub use action_handler::GroupActionHandler;
pub use channel::GroupChannel;
pub use channel_registry::GroupChannelRegistry;
pub use dispatcher::{GroupDispatcher, WeakGroupDispatcher};
pub use errors::{DispatchError, Result};
pub use msg_builder::GroupActionMsgBuilder;
pub use registry::GroupDispatcherRegistry;
