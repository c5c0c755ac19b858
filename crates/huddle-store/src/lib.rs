//! # huddle-store
//!
//! Durable group membership for the huddle services.
//!
//! - [`GroupResultDao`]: load, find and write [`GroupResult`](huddle_core::GroupResult)s
//! - [`GroupStore`]: pooled `SQLite` access with serialized write transactions
//! - Embedded schema migrations, applied on open

#![deny(unsafe_code)]

pub mod errors;
pub mod sqlite;
pub mod store;

pub use errors::{Result, StoreError};
pub use sqlite::connection::{ConnectionConfig, ConnectionPool};
pub use sqlite::repositories::{GroupResultDao, SqliteGroupResultDao};
pub use store::GroupStore;
