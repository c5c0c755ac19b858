//! High-level `GroupStore` API.
//!
//! Wraps the connection pool. Multi-step membership changes go through
//! [`GroupStore::in_transaction`], which takes the database write lock up
//! front so concurrent joins and leaves are serialized.

use std::path::Path;

use huddle_core::{GroupResult, GroupResultId, GroupState, ParticipantId};
use rusqlite::TransactionBehavior;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::{Result, StoreError};
use crate::sqlite::connection::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::sqlite::migrations::run_migrations;
use crate::sqlite::repositories::{GroupResultDao, SqliteGroupResultDao};

/// Pooled access to persisted groups.
#[derive(Clone)]
pub struct GroupStore {
    pool: ConnectionPool,
}

impl GroupStore {
    /// Wrap an already-migrated pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Open an in-memory store with the schema applied.
    pub fn open_in_memory() -> Result<Self> {
        let pool = connection::new_in_memory(&ConnectionConfig::default())?;
        Self::migrated(pool)
    }

    /// Open (or create) a file-backed store with the schema applied.
    pub fn open(path: &Path, config: &ConnectionConfig) -> Result<Self> {
        let path = path.to_str().ok_or_else(|| StoreError::Migration {
            message: format!("database path is not valid UTF-8: {}", path.display()),
        })?;
        let pool = connection::new_file(path, config)?;
        Self::migrated(pool)
    }

    fn migrated(pool: ConnectionPool) -> Result<Self> {
        {
            let conn = pool.get()?;
            let _ = run_migrations(&conn)?;
        }
        Ok(Self::new(pool))
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside one immediate transaction.
    ///
    /// Commits if `f` returns `Ok`, rolls back otherwise. `f` must not call
    /// back into this store: the pool may hold a single connection.
    pub fn in_transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&dyn GroupResultDao) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let out = f(&SqliteGroupResultDao::new(&tx))?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    /// Run read-only `f` on a pooled connection.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn GroupResultDao) -> Result<T>,
    {
        let conn = self.conn()?;
        f(&SqliteGroupResultDao::new(&conn))
    }

    /// Load one group.
    pub fn get_group(&self, id: &GroupResultId) -> Result<Option<GroupResult>> {
        self.read(|dao| dao.get(id))
    }

    /// The group in which `participant` is currently active.
    pub fn find_active_for(&self, participant: &ParticipantId) -> Result<Option<GroupResult>> {
        self.read(|dao| dao.find_active_for(participant))
    }

    /// Store new session data if the stored version is still
    /// `expected_version`, bumping it by one. Returns the new version, or
    /// `None` if the version moved on or the group is finished.
    #[instrument(skip(self, data), fields(group_id = %id))]
    pub fn update_session(
        &self,
        id: &GroupResultId,
        expected_version: u64,
        data: &Value,
    ) -> Result<Option<u64>> {
        let new_version = expected_version + 1;
        let written = self.read(|dao| dao.update_session(id, expected_version, data, new_version))?;
        debug!(written, new_version, "session update");
        Ok(written.then_some(new_version))
    }

    /// Move an open group to `FIXED`. Returns the group as stored afterwards,
    /// or `None` if it does not exist.
    #[instrument(skip(self), fields(group_id = %id))]
    pub fn fix_group(&self, id: &GroupResultId) -> Result<Option<GroupResult>> {
        self.in_transaction(|dao| {
            let Some(mut group) = dao.get(id)? else {
                return Ok(None);
            };
            if group.fix() {
                dao.update(&group)?;
                debug!(state = %GroupState::Fixed, "group fixed");
            }
            Ok(Some(group))
        })
    }
}
