use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::domain::models::{
    NewParkingSessionRecord, NewSlotRecord, ParkingSessionRecord, SlotRecord, SlotStatusRecord,
    SlotWithStatus,
};

pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
CREATE TABLE IF NOT EXISTS parking_slots (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    allowed_minutes INTEGER NOT NULL,
    is_disabled INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS slot_status (
    slot_id TEXT PRIMARY KEY REFERENCES parking_slots(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    occupied_since TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS parking_sessions (
    id TEXT PRIMARY KEY,
    slot_id TEXT,
    slot_name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL,
    amount_charged REAL NOT NULL,
    was_overtime INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (slot_name, started_at)
);

CREATE INDEX IF NOT EXISTS idx_parking_sessions_ended_at_desc
ON parking_sessions (ended_at DESC);
"#,
)];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    let connection = Connection::open(path)?;
    connection.pragma_update(None, "foreign_keys", true)?;
    Ok(connection)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Creates the slot plus its initial vacant status row. Returns the full
/// slot record with its generated id.
pub fn insert_slot(
    connection: &Connection,
    new_slot: &NewSlotRecord,
    now_iso: &str,
) -> Result<SlotRecord, DbError> {
    let id = uuid::Uuid::new_v4().to_string();

    connection.execute(
        "INSERT INTO parking_slots (id, name, allowed_minutes, is_disabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        params![id, new_slot.name, new_slot.allowed_minutes, now_iso],
    )?;
    connection.execute(
        "INSERT INTO slot_status (slot_id, status, occupied_since, updated_at)
         VALUES (?1, 'vacant', NULL, ?2)",
        params![id, now_iso],
    )?;

    Ok(SlotRecord {
        id,
        name: new_slot.name.clone(),
        allowed_minutes: new_slot.allowed_minutes,
        is_disabled: false,
        created_at: now_iso.to_string(),
        updated_at: now_iso.to_string(),
    })
}

/// Deletes a slot by name; the status row goes with it via cascade. Sessions
/// keep their denormalized slot_name. Returns false when no such slot exists.
pub fn delete_slot(connection: &Connection, name: &str) -> Result<bool, DbError> {
    let deleted = connection.execute("DELETE FROM parking_slots WHERE name = ?1", params![name])?;
    Ok(deleted > 0)
}

pub fn get_slot_by_name(connection: &Connection, name: &str) -> Result<Option<SlotRecord>, DbError> {
    let slot = connection
        .query_row(
            "SELECT id, name, allowed_minutes, is_disabled, created_at, updated_at
             FROM parking_slots
             WHERE name = ?1",
            params![name],
            slot_from_row,
        )
        .optional()?;
    Ok(slot)
}

pub fn count_slots(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM parking_slots", [], |row| row.get(0))?;
    Ok(count)
}

pub fn list_slots_with_status(connection: &Connection) -> Result<Vec<SlotWithStatus>, DbError> {
    let mut statement = connection.prepare(
        "SELECT s.id, s.name, s.allowed_minutes, s.is_disabled, s.created_at, s.updated_at,
                st.status, st.occupied_since, st.updated_at
         FROM parking_slots s
         JOIN slot_status st ON st.slot_id = s.id
         ORDER BY s.name ASC",
    )?;

    let rows = statement.query_map([], |row| {
        Ok(SlotWithStatus {
            slot: SlotRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                allowed_minutes: row.get(2)?,
                is_disabled: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            },
            status: SlotStatusRecord {
                slot_id: row.get(0)?,
                status: row.get(6)?,
                occupied_since: row.get(7)?,
                updated_at: row.get(8)?,
            },
        })
    })?;

    let mut slots = Vec::new();
    for row in rows {
        slots.push(row?);
    }

    Ok(slots)
}

pub fn update_slot_status(
    connection: &Connection,
    slot_id: &str,
    status: &str,
    occupied_since: Option<&str>,
    updated_at: &str,
) -> Result<(), DbError> {
    connection.execute(
        "UPDATE slot_status
         SET status = ?2, occupied_since = ?3, updated_at = ?4
         WHERE slot_id = ?1",
        params![slot_id, status, occupied_since, updated_at],
    )?;
    Ok(())
}

pub fn set_slot_disabled(
    connection: &Connection,
    slot_id: &str,
    disabled: bool,
    updated_at: &str,
) -> Result<(), DbError> {
    connection.execute(
        "UPDATE parking_slots SET is_disabled = ?2, updated_at = ?3 WHERE id = ?1",
        params![slot_id, disabled, updated_at],
    )?;
    Ok(())
}

/// Result of a session insert. Duplicate delivery of the same vacate event
/// lands on the `(slot_name, started_at)` unique key and is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInsert {
    Inserted { id: String },
    Duplicate,
}

pub fn insert_session(
    connection: &Connection,
    new_session: &NewParkingSessionRecord,
) -> Result<SessionInsert, DbError> {
    let id = uuid::Uuid::new_v4().to_string();

    let inserted = connection.execute(
        "INSERT OR IGNORE INTO parking_sessions
         (id, slot_id, slot_name, started_at, ended_at, duration_minutes,
          amount_charged, was_overtime, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            new_session.slot_id,
            new_session.slot_name,
            new_session.started_at,
            new_session.ended_at,
            new_session.duration_minutes,
            new_session.amount_charged,
            new_session.was_overtime,
            new_session.created_at,
        ],
    )?;

    if inserted == 0 {
        return Ok(SessionInsert::Duplicate);
    }
    Ok(SessionInsert::Inserted { id })
}

pub fn get_latest_session(
    connection: &Connection,
) -> Result<Option<ParkingSessionRecord>, DbError> {
    let session = connection
        .query_row(
            "SELECT id, slot_id, slot_name, started_at, ended_at, duration_minutes,
                    amount_charged, was_overtime, created_at
             FROM parking_sessions
             ORDER BY ended_at DESC, id DESC
             LIMIT 1",
            [],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

pub fn list_sessions(
    connection: &Connection,
    limit: u32,
    offset: u32,
) -> Result<Vec<ParkingSessionRecord>, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, slot_id, slot_name, started_at, ended_at, duration_minutes,
                amount_charged, was_overtime, created_at
         FROM parking_sessions
         ORDER BY ended_at DESC, id DESC
         LIMIT ?1 OFFSET ?2",
    )?;

    let rows = statement.query_map(params![i64::from(limit), i64::from(offset)], session_from_row)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }

    Ok(sessions)
}

pub fn count_sessions(connection: &Connection) -> Result<i64, DbError> {
    let count =
        connection.query_row("SELECT COUNT(*) FROM parking_sessions", [], |row| row.get(0))?;
    Ok(count)
}

/// Session count and revenue for sessions that ended in `[from, to)`.
pub fn session_stats_between(
    connection: &Connection,
    from_iso: &str,
    to_iso: &str,
) -> Result<(i64, f64), DbError> {
    let stats = connection.query_row(
        "SELECT COUNT(*), COALESCE(SUM(amount_charged), 0.0)
         FROM parking_sessions
         WHERE ended_at >= ?1 AND ended_at < ?2",
        params![from_iso, to_iso],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(stats)
}

fn slot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SlotRecord> {
    Ok(SlotRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        allowed_minutes: row.get(2)?,
        is_disabled: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParkingSessionRecord> {
    Ok(ParkingSessionRecord {
        id: row.get(0)?,
        slot_id: row.get(1)?,
        slot_name: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        duration_minutes: row.get(5)?,
        amount_charged: row.get(6)?,
        was_overtime: row.get(7)?,
        created_at: row.get(8)?,
    })
}
