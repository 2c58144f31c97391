use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::{DbError, SessionInsert};
use crate::domain::models::{
    NewParkingSessionRecord, NewSlotRecord, ParkingSessionRecord, SlotRecord, SlotWithStatus,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

/// Which table a repository write touched. Subscribers use this to refresh
/// caches when a change originates outside their own pipeline (e.g. an admin
/// HTTP action while the reader loop is running).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableChange {
    Slots,
    SlotStatus,
    Sessions,
}

pub trait SlotQueryHandler {
    fn list_slots(&self) -> Result<Vec<SlotWithStatus>, ServiceError>;
    fn get_slot_by_name(&self, name: &str) -> Result<Option<SlotRecord>, ServiceError>;
    fn count_slots(&self) -> Result<i64, ServiceError>;
    fn get_latest_session(&self) -> Result<Option<ParkingSessionRecord>, ServiceError>;
    fn list_sessions(&self, limit: u32, offset: u32)
    -> Result<Vec<ParkingSessionRecord>, ServiceError>;
    fn count_sessions(&self) -> Result<i64, ServiceError>;
    fn session_stats_between(&self, from_iso: &str, to_iso: &str)
    -> Result<(i64, f64), ServiceError>;
    fn get_schema_version(&self) -> Result<u32, ServiceError>;
}

pub trait SlotCommandHandler {
    fn add_slot(&self, new_slot: &NewSlotRecord, now_iso: &str) -> Result<SlotRecord, ServiceError>;
    fn delete_slot(&self, name: &str) -> Result<bool, ServiceError>;
    fn update_status(
        &self,
        slot_id: &str,
        status: &str,
        occupied_since: Option<&str>,
        updated_at: &str,
    ) -> Result<(), ServiceError>;
    fn set_disabled(&self, slot_id: &str, disabled: bool, updated_at: &str)
    -> Result<(), ServiceError>;
    fn insert_session(
        &self,
        new_session: &NewParkingSessionRecord,
    ) -> Result<SessionInsert, ServiceError>;
}

/// SQLite-backed slot repository plus a change feed. Clones share the same
/// connection and subscriber list.
#[derive(Clone)]
pub struct SqliteSlotService {
    connection: Arc<Mutex<Connection>>,
    subscribers: Arc<Mutex<Vec<Sender<TableChange>>>>,
}

impl SqliteSlotService {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self {
            connection,
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a change-feed subscriber. The receiver sees one message per
    /// repository write until it is dropped.
    pub fn subscribe(&self) -> Receiver<TableChange> {
        let (tx, rx) = channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn notify(&self, change: TableChange) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|subscriber| subscriber.send(change).is_ok());
        }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }
}

impl SlotQueryHandler for SqliteSlotService {
    fn list_slots(&self) -> Result<Vec<SlotWithStatus>, ServiceError> {
        self.with_connection(db::list_slots_with_status)
    }

    fn get_slot_by_name(&self, name: &str) -> Result<Option<SlotRecord>, ServiceError> {
        self.with_connection(|connection| db::get_slot_by_name(connection, name))
    }

    fn count_slots(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_slots)
    }

    fn get_latest_session(&self) -> Result<Option<ParkingSessionRecord>, ServiceError> {
        self.with_connection(db::get_latest_session)
    }

    fn list_sessions(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ParkingSessionRecord>, ServiceError> {
        self.with_connection(|connection| db::list_sessions(connection, limit, offset))
    }

    fn count_sessions(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_sessions)
    }

    fn session_stats_between(
        &self,
        from_iso: &str,
        to_iso: &str,
    ) -> Result<(i64, f64), ServiceError> {
        self.with_connection(|connection| db::session_stats_between(connection, from_iso, to_iso))
    }

    fn get_schema_version(&self) -> Result<u32, ServiceError> {
        self.with_connection(db::schema_version)
    }
}

impl SlotCommandHandler for SqliteSlotService {
    fn add_slot(&self, new_slot: &NewSlotRecord, now_iso: &str) -> Result<SlotRecord, ServiceError> {
        let slot = self.with_connection(|connection| db::insert_slot(connection, new_slot, now_iso))?;
        self.notify(TableChange::Slots);
        Ok(slot)
    }

    fn delete_slot(&self, name: &str) -> Result<bool, ServiceError> {
        let deleted = self.with_connection(|connection| db::delete_slot(connection, name))?;
        if deleted {
            self.notify(TableChange::Slots);
        }
        Ok(deleted)
    }

    fn update_status(
        &self,
        slot_id: &str,
        status: &str,
        occupied_since: Option<&str>,
        updated_at: &str,
    ) -> Result<(), ServiceError> {
        self.with_connection(|connection| {
            db::update_slot_status(connection, slot_id, status, occupied_since, updated_at)
        })?;
        self.notify(TableChange::SlotStatus);
        Ok(())
    }

    fn set_disabled(
        &self,
        slot_id: &str,
        disabled: bool,
        updated_at: &str,
    ) -> Result<(), ServiceError> {
        self.with_connection(|connection| {
            db::set_slot_disabled(connection, slot_id, disabled, updated_at)
        })?;
        self.notify(TableChange::Slots);
        Ok(())
    }

    fn insert_session(
        &self,
        new_session: &NewParkingSessionRecord,
    ) -> Result<SessionInsert, ServiceError> {
        let inserted =
            self.with_connection(|connection| db::insert_session(connection, new_session))?;
        if matches!(inserted, SessionInsert::Inserted { .. }) {
            self.notify(TableChange::Sessions);
        }
        Ok(inserted)
    }
}
