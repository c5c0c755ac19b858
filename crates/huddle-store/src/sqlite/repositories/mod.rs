//! Repositories over a borrowed `SQLite` connection.

pub mod group_result;

pub use group_result::{GroupResultDao, SqliteGroupResultDao};
