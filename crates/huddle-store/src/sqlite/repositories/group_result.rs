//! Group result repository: one row per group plus its ordered roster.
//!
//! Members live in `group_members` keyed by `(group_id, participant_id)`,
//! which keeps a participant out of both lists of the same group at once.
//! A partial unique index keeps a participant active in at most one group.

use chrono::{DateTime, Utc};
use huddle_core::{BatchId, GroupResult, GroupResultId, GroupState, ParticipantId};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::errors::{Result, StoreError};

const ACTIVE: &str = "active";
const HISTORY: &str = "history";

const SELECT_GROUP: &str = "SELECT id, batch_id, state, session_data, session_version, \
     start_date, end_date FROM group_results";

/// Data access for [`GroupResult`]s.
///
/// Callers that need atomicity use this through
/// [`GroupStore::in_transaction`](crate::GroupStore::in_transaction).
pub trait GroupResultDao {
    /// Load one group.
    fn get(&self, id: &GroupResultId) -> Result<Option<GroupResult>>;

    /// All groups of a batch, optionally filtered by state, in creation order.
    fn find_by_batch(
        &self,
        batch_id: &BatchId,
        state: Option<GroupState>,
    ) -> Result<Vec<GroupResult>>;

    /// The group in which `participant` is currently active, if any.
    fn find_active_for(&self, participant: &ParticipantId) -> Result<Option<GroupResult>>;

    /// Persist a new group.
    fn insert(&self, group: &GroupResult) -> Result<()>;

    /// Overwrite an existing group, roster included.
    fn update(&self, group: &GroupResult) -> Result<()>;

    /// Write new session data only if the stored version still equals
    /// `expected_version`. Returns whether the write happened.
    fn update_session(
        &self,
        id: &GroupResultId,
        expected_version: u64,
        data: &Value,
        new_version: u64,
    ) -> Result<bool>;
}

/// [`GroupResultDao`] over a borrowed `SQLite` connection.
pub struct SqliteGroupResultDao<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteGroupResultDao<'c> {
    /// Wrap a connection (or an open transaction).
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn load_members(&self, group: &mut GroupResult) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT participant_id, status FROM group_members
             WHERE group_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![group.id.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (participant, status) = row?;
            let participant = ParticipantId::from_raw(participant);
            match status.as_str() {
                ACTIVE => group.active_members.push(participant),
                HISTORY => group.history_members.push(participant),
                other => {
                    return Err(StoreError::CorruptRow {
                        table: "group_members",
                        column: "status",
                        detail: format!("unknown status: {other}"),
                    });
                }
            }
        }
        Ok(())
    }

    fn write_members(&self, group: &GroupResult) -> Result<()> {
        let _ = self.conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1",
            params![group.id.as_str()],
        )?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO group_members (group_id, participant_id, status, position)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (position, participant) in group.history_members.iter().enumerate() {
            let _ = stmt.execute(params![
                group.id.as_str(),
                participant.as_str(),
                HISTORY,
                position as i64
            ])?;
        }
        for (position, participant) in group.active_members.iter().enumerate() {
            let _ = stmt.execute(params![
                group.id.as_str(),
                participant.as_str(),
                ACTIVE,
                position as i64
            ])?;
        }
        Ok(())
    }

    fn query_groups(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<GroupResult>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(args, RawGroupRow::from_row)?;
        let mut groups = Vec::new();
        for row in rows {
            let mut group = row?.into_group()?;
            self.load_members(&mut group)?;
            groups.push(group);
        }
        Ok(groups)
    }
}

impl GroupResultDao for SqliteGroupResultDao<'_> {
    fn get(&self, id: &GroupResultId) -> Result<Option<GroupResult>> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_GROUP} WHERE id = ?1"),
                params![id.as_str()],
                RawGroupRow::from_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut group = row.into_group()?;
        self.load_members(&mut group)?;
        Ok(Some(group))
    }

    fn find_by_batch(
        &self,
        batch_id: &BatchId,
        state: Option<GroupState>,
    ) -> Result<Vec<GroupResult>> {
        match state {
            Some(state) => self.query_groups(
                &format!("{SELECT_GROUP} WHERE batch_id = ?1 AND state = ?2 ORDER BY seq ASC"),
                params![batch_id.as_str(), state.to_string()],
            ),
            None => self.query_groups(
                &format!("{SELECT_GROUP} WHERE batch_id = ?1 ORDER BY seq ASC"),
                params![batch_id.as_str()],
            ),
        }
    }

    fn find_active_for(&self, participant: &ParticipantId) -> Result<Option<GroupResult>> {
        let group_id: Option<String> = self
            .conn
            .query_row(
                "SELECT group_id FROM group_members WHERE participant_id = ?1 AND status = ?2",
                params![participant.as_str(), ACTIVE],
                |row| row.get(0),
            )
            .optional()?;
        match group_id {
            Some(id) => self.get(&GroupResultId::from_raw(id)),
            None => Ok(None),
        }
    }

    fn insert(&self, group: &GroupResult) -> Result<()> {
        let session = encode_session(group.session_data.as_ref())?;
        let _ = self.conn.execute(
            "INSERT INTO group_results
             (id, batch_id, state, session_data, session_version, start_date, end_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                group.id.as_str(),
                group.batch_id.as_str(),
                group.state.to_string(),
                session,
                group.session_version as i64,
                group.start_date.to_rfc3339(),
                group.end_date.map(|d| d.to_rfc3339()),
            ],
        )?;
        self.write_members(group)
    }

    fn update(&self, group: &GroupResult) -> Result<()> {
        let session = encode_session(group.session_data.as_ref())?;
        let changed = self.conn.execute(
            "UPDATE group_results
             SET state = ?2, session_data = ?3, session_version = ?4, end_date = ?5
             WHERE id = ?1",
            params![
                group.id.as_str(),
                group.state.to_string(),
                session,
                group.session_version as i64,
                group.end_date.map(|d| d.to_rfc3339()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::GroupNotFound(group.id.to_string()));
        }
        self.write_members(group)
    }

    fn update_session(
        &self,
        id: &GroupResultId,
        expected_version: u64,
        data: &Value,
        new_version: u64,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE group_results SET session_data = ?3, session_version = ?4
             WHERE id = ?1 AND session_version = ?2 AND state != 'FINISHED'",
            params![
                id.as_str(),
                expected_version as i64,
                serde_json::to_string(data)?,
                new_version as i64
            ],
        )?;
        Ok(changed == 1)
    }
}

fn encode_session(data: Option<&Value>) -> Result<Option<String>> {
    Ok(data.map(serde_json::to_string).transpose()?)
}

struct RawGroupRow {
    id: String,
    batch_id: String,
    state: String,
    session_data: Option<String>,
    session_version: i64,
    start_date: String,
    end_date: Option<String>,
}

impl RawGroupRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            batch_id: row.get(1)?,
            state: row.get(2)?,
            session_data: row.get(3)?,
            session_version: row.get(4)?,
            start_date: row.get(5)?,
            end_date: row.get(6)?,
        })
    }

    fn into_group(self) -> Result<GroupResult> {
        let state = self
            .state
            .parse::<GroupState>()
            .map_err(|detail| StoreError::CorruptRow {
                table: "group_results",
                column: "state",
                detail,
            })?;
        let session_data = self
            .session_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let session_version =
            u64::try_from(self.session_version).map_err(|e| StoreError::CorruptRow {
                table: "group_results",
                column: "session_version",
                detail: e.to_string(),
            })?;
        Ok(GroupResult {
            id: GroupResultId::from_raw(self.id),
            batch_id: BatchId::from_raw(self.batch_id),
            state,
            active_members: Vec::new(),
            history_members: Vec::new(),
            session_data,
            session_version,
            start_date: parse_date(&self.start_date, "start_date")?,
            end_date: self
                .end_date
                .as_deref()
                .map(|d| parse_date(d, "end_date"))
                .transpose()?,
        })
    }
}

fn parse_date(raw: &str, column: &'static str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "group_results",
            column,
            detail: e.to_string(),
        })
}
