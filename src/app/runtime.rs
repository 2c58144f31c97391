use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use chrono::{SecondsFormat, Utc};
use thiserror::Error;

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::db::SessionInsert;
use crate::adapters::link::{DeviceLink, LinkError, TcpDeviceLink};
use crate::adapters::replay::ReplayFileLink;
use crate::app::config::{AppConfig, DeviceSource};
use crate::app::error::AppError;
use crate::app::services::{
    ServiceError, SlotCommandHandler, SlotQueryHandler, SqliteSlotService, TableChange,
};
use crate::domain::billing::BillingPolicy;
use crate::domain::framing::LineFramer;
use crate::domain::models::{NewParkingSessionRecord, SlotState};
use crate::domain::occupancy::{
    ApplyOutcome, Clock, OccupancyTracker, SessionToRecord, SlotSnapshot, TimestampMs, Transition,
};
use crate::domain::protocol::{Command, DeviceEvent, EncodeError, decode};

const SESSION_QUEUE_CAPACITY: usize = 64;
const READ_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(Utc::now().timestamp_millis())
    }
}

pub fn timestamp_to_iso8601(timestamp: TimestampMs) -> String {
    let datetime = chrono::DateTime::<Utc>::from_timestamp_millis(timestamp.0)
        .unwrap_or_else(|| chrono::DateTime::<Utc>::from(std::time::UNIX_EPOCH));
    datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_iso8601_millis(value: &str) -> Option<TimestampMs> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|datetime| TimestampMs(datetime.timestamp_millis()))
}

/// Connection-quality snapshot surfaced to the HTTP API. Connection loss is
/// a status change here, never an error bubbled to callers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkHealth {
    pub connected: bool,
    pub rssi: Option<i64>,
    pub last_event_at: Option<String>,
}

pub type SharedLinkHealth = Arc<Mutex<LinkHealth>>;

#[derive(Debug, Error)]
pub enum CommandSendError {
    #[error("device not connected")]
    NotConnected,
    #[error("{0}")]
    Encode(#[from] EncodeError),
    #[error("failed to write command: {0}")]
    Io(#[from] std::io::Error),
    #[error("link handle lock poisoned")]
    LockPoisoned,
}

/// Write half of the device link. Holds whichever link is currently live so
/// command writes from the HTTP layer never touch the reader loop.
#[derive(Clone, Default)]
pub struct CommandSender {
    link: Arc<Mutex<Option<Arc<dyn DeviceLink>>>>,
}

impl CommandSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, command: &Command) -> Result<(), CommandSendError> {
        let wire = command.encode()?;
        let guard = self.link.lock().map_err(|_| CommandSendError::LockPoisoned)?;
        let link = guard.as_ref().ok_or(CommandSendError::NotConnected)?;
        link.write_all(wire.as_bytes())?;
        Ok(())
    }

    fn attach(&self, link: Arc<dyn DeviceLink>) {
        if let Ok(mut guard) = self.link.lock() {
            *guard = Some(link);
        }
    }

    fn detach_and_shutdown(&self) {
        if let Ok(mut guard) = self.link.lock()
            && let Some(link) = guard.take()
        {
            link.shutdown();
        }
    }
}

/// Single consumer of the inbound byte stream: frames chunks into lines,
/// decodes them, drives the occupancy tracker, mirrors status to the
/// repository, and hands completed cycles to the recorder queue.
pub struct EventPipeline<Cl, S> {
    clock: Cl,
    service: S,
    tracker: OccupancyTracker,
    framer: LineFramer,
    session_tx: SyncSender<SessionToRecord>,
    changes: Receiver<TableChange>,
    health: SharedLinkHealth,
}

impl<Cl, S> EventPipeline<Cl, S>
where
    Cl: Clock,
    S: SlotQueryHandler + SlotCommandHandler,
{
    pub fn new(
        clock: Cl,
        service: S,
        max_line_bytes: usize,
        session_tx: SyncSender<SessionToRecord>,
        changes: Receiver<TableChange>,
        health: SharedLinkHealth,
    ) -> Self {
        Self {
            clock,
            service,
            tracker: OccupancyTracker::new(),
            framer: LineFramer::new(max_line_bytes),
            session_tx,
            changes,
            health,
        }
    }

    /// Rebuilds the tracker cache from repository state. The device only
    /// knows slot names; a disabled flag in the repository wins over
    /// whatever status text is stored.
    pub fn reload_slots(&mut self) -> Result<(), ServiceError> {
        let rows = self.service.list_slots()?;
        let snapshots = rows
            .into_iter()
            .map(|row| {
                let state = if row.slot.is_disabled {
                    SlotState::Disabled
                } else {
                    SlotState::parse(&row.status.status).unwrap_or(SlotState::Vacant)
                };
                let occupied_since = match state {
                    SlotState::Occupied | SlotState::Overtime => row
                        .status
                        .occupied_since
                        .as_deref()
                        .and_then(parse_iso8601_millis),
                    _ => None,
                };
                SlotSnapshot {
                    slot_id: row.slot.id,
                    name: row.slot.name,
                    allowed_minutes: row.slot.allowed_minutes,
                    state,
                    occupied_since,
                }
            })
            .collect();
        self.tracker.sync_slots(snapshots);
        Ok(())
    }

    pub fn handle_chunk(&mut self, chunk: &[u8]) {
        self.drain_change_feed();

        for line in self.framer.feed(chunk) {
            self.handle_line(&line);
        }
    }

    fn drain_change_feed(&mut self) {
        let mut slots_changed = false;
        while let Ok(change) = self.changes.try_recv() {
            if matches!(change, TableChange::Slots | TableChange::SlotStatus) {
                slots_changed = true;
            }
        }

        if slots_changed
            && let Err(error) = self.reload_slots()
        {
            tracing::warn!(error = %error, "failed to refresh slot cache after external change");
        }
    }

    fn handle_line(&mut self, line: &str) {
        match decode(line) {
            DeviceEvent::SlotOccupancy {
                slot_name,
                raw_status,
            } => self.handle_occupancy(&slot_name, &raw_status),
            DeviceEvent::SensorReading { slot_name, value } => {
                tracing::debug!(slot = %slot_name, value, "sensor reading");
            }
            DeviceEvent::PingAck { slot_name } => {
                tracing::info!(slot = %slot_name, "ping acknowledged");
            }
            DeviceEvent::SignalStrength { rssi } => {
                if let Ok(mut health) = self.health.lock() {
                    health.rssi = Some(rssi);
                }
                tracing::debug!(rssi, "signal strength report");
            }
            DeviceEvent::Unrecognized { raw } => {
                // Noisy serial links are expected; absorb and move on.
                tracing::debug!(raw = %raw, "unrecognized device line");
            }
        }

        if let Ok(mut health) = self.health.lock() {
            health.last_event_at = Some(timestamp_to_iso8601(self.clock.now()));
        }
    }

    fn handle_occupancy(&mut self, slot_name: &str, raw_status: &str) {
        let now = self.clock.now();

        match self.tracker.apply(slot_name, raw_status, now) {
            ApplyOutcome::Transition(Transition::Entered {
                slot_name,
                occupied_since,
            }) => {
                let Some(slot) = self.tracker.get(&slot_name) else {
                    return;
                };
                let state = slot.state;
                let slot_id = slot.slot_id.clone();
                tracing::info!(slot = %slot_name, status = state.as_str(), "slot entered");
                self.persist_status(
                    &slot_id,
                    state,
                    Some(timestamp_to_iso8601(occupied_since)),
                    now,
                );
            }
            ApplyOutcome::Transition(Transition::WentOvertime { slot_name }) => {
                let Some(slot) = self.tracker.get(&slot_name) else {
                    return;
                };
                let slot_id = slot.slot_id.clone();
                let occupied_since = slot.occupied_since.map(timestamp_to_iso8601);
                tracing::info!(slot = %slot_name, "slot went into overtime");
                self.persist_status(&slot_id, SlotState::Overtime, occupied_since, now);
            }
            ApplyOutcome::Transition(Transition::Vacated { session }) => {
                if let Some(slot_id) = session.slot_id.as_deref() {
                    self.persist_status(slot_id, SlotState::Vacant, None, now);
                }
                tracing::info!(
                    slot = %session.slot_name,
                    started_at = %timestamp_to_iso8601(session.started_at),
                    ended_at = %timestamp_to_iso8601(session.ended_at),
                    "occupancy cycle completed"
                );
                match self.session_tx.try_send(session) {
                    Ok(()) => {}
                    Err(TrySendError::Full(session)) => {
                        tracing::error!(
                            slot = %session.slot_name,
                            "session queue full, billing record dropped"
                        );
                    }
                    Err(TrySendError::Disconnected(session)) => {
                        tracing::error!(
                            slot = %session.slot_name,
                            "session recorder gone, billing record dropped"
                        );
                    }
                }
            }
            ApplyOutcome::NoChange => {
                tracing::debug!(slot = %slot_name, status = %raw_status, "redundant occupancy report");
            }
            ApplyOutcome::UnknownSlot => {
                tracing::warn!(slot = %slot_name, "occupancy report for unknown slot ignored");
            }
            ApplyOutcome::UnknownStatus(status) => {
                tracing::warn!(slot = %slot_name, status = %status, "unknown occupancy status ignored");
            }
            ApplyOutcome::DisabledIgnored => {
                tracing::debug!(slot = %slot_name, "occupancy report for disabled slot ignored");
            }
        }
    }

    /// Mirrors a transition into the repository. A failed write is logged
    /// and must not stall the pipeline; the in-memory state has already
    /// advanced.
    fn persist_status(
        &self,
        slot_id: &str,
        state: SlotState,
        occupied_since: Option<String>,
        now: TimestampMs,
    ) {
        if let Err(error) = self.service.update_status(
            slot_id,
            state.as_str(),
            occupied_since.as_deref(),
            &timestamp_to_iso8601(now),
        ) {
            tracing::warn!(slot_id = %slot_id, error = %error, "failed to persist slot status");
        }
    }
}

pub fn build_session_record(
    session: &SessionToRecord,
    policy: &BillingPolicy,
    created_at: TimestampMs,
) -> NewParkingSessionRecord {
    let duration_minutes = ((session.ended_at.0 - session.started_at.0) / 60_000).max(0);
    let billing = policy.calculate(duration_minutes, session.allowed_minutes);

    NewParkingSessionRecord {
        slot_id: session.slot_id.clone(),
        slot_name: session.slot_name.clone(),
        started_at: timestamp_to_iso8601(session.started_at),
        ended_at: timestamp_to_iso8601(session.ended_at),
        duration_minutes,
        amount_charged: billing.amount,
        was_overtime: billing.is_overtime,
        created_at: timestamp_to_iso8601(created_at),
    }
}

/// Bills and persists completed cycles off the reader thread. Exits when all
/// senders are gone.
pub fn start_recorder<S>(
    service: S,
    policy: BillingPolicy,
    receiver: Receiver<SessionToRecord>,
) -> JoinHandle<()>
where
    S: SlotCommandHandler + Send + 'static,
{
    std::thread::spawn(move || {
        for session in receiver.iter() {
            let record = build_session_record(&session, &policy, SystemClock.now());
            record_with_retry(&service, &record);
        }
    })
}

fn record_with_retry<S: SlotCommandHandler>(service: &S, record: &NewParkingSessionRecord) {
    for attempt in 1..=2 {
        match service.insert_session(record) {
            Ok(SessionInsert::Inserted { id }) => {
                tracing::info!(
                    session_id = %id,
                    slot = %record.slot_name,
                    duration_minutes = record.duration_minutes,
                    amount_charged = record.amount_charged,
                    was_overtime = record.was_overtime,
                    "parking session persisted"
                );
                return;
            }
            Ok(SessionInsert::Duplicate) => {
                tracing::info!(
                    slot = %record.slot_name,
                    started_at = %record.started_at,
                    "duplicate session delivery ignored"
                );
                return;
            }
            Err(error) if attempt < 2 => {
                tracing::warn!(slot = %record.slot_name, error = %error, "session write failed, retrying");
            }
            Err(error) => {
                tracing::error!(slot = %record.slot_name, error = %error, "session write failed, record lost");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    StopRequested,
    ConnectionLost,
}

/// Blocking read loop for one connection. Read timeouts are used purely to
/// poll the stop flag; EOF and hard errors end the connection.
pub fn run_reader_loop<Cl, S>(
    link: &Arc<dyn DeviceLink>,
    pipeline: &mut EventPipeline<Cl, S>,
    stop_flag: &AtomicBool,
) -> ReaderExit
where
    Cl: Clock,
    S: SlotQueryHandler + SlotCommandHandler,
{
    let mut buffer = [0_u8; READ_BUFFER_SIZE];

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            return ReaderExit::StopRequested;
        }

        match link.read_chunk(&mut buffer) {
            Ok(0) => {
                tracing::info!("device closed the connection");
                return ReaderExit::ConnectionLost;
            }
            Ok(size) => pipeline.handle_chunk(&buffer[..size]),
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(error) => {
                tracing::warn!(error = %error, "device read failed");
                return ReaderExit::ConnectionLost;
            }
        }
    }
}

fn open_link(source: &DeviceSource, read_timeout: Duration) -> Result<Arc<dyn DeviceLink>, LinkError> {
    match source {
        DeviceSource::Tcp { addr } => {
            let link = TcpDeviceLink::connect(addr, read_timeout)?;
            Ok(Arc::new(link))
        }
        DeviceSource::Replay { path } => {
            let link = ReplayFileLink::from_file(path)?;
            Ok(Arc::new(link))
        }
    }
}

/// Supervises the device connection: connect, run the reader loop with a
/// fresh framer, and reconnect after a delay on loss. Reconnection policy
/// lives here, outside the pipeline itself.
pub fn start_monitor(
    config: AppConfig,
    service: SqliteSlotService,
    commands: CommandSender,
    health: SharedLinkHealth,
    session_tx: SyncSender<SessionToRecord>,
    stop_flag: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let read_timeout = Duration::from_millis(config.read_timeout_ms.max(1));
        let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);

        while !stop_flag.load(Ordering::Relaxed) {
            let link = match open_link(&config.device_source, read_timeout) {
                Ok(link) => link,
                Err(error) => {
                    tracing::warn!(error = %error, "device connection failed");
                    sleep_unless_stopped(&stop_flag, reconnect_delay);
                    continue;
                }
            };

            tracing::info!("device connected");
            commands.attach(Arc::clone(&link));
            set_connected(&health, true);

            // A fresh pipeline per connection: a torn line from the previous
            // stream is unrecoverable.
            let mut pipeline = EventPipeline::new(
                SystemClock,
                service.clone(),
                config.max_line_bytes,
                session_tx.clone(),
                service.subscribe(),
                Arc::clone(&health),
            );
            if let Err(error) = pipeline.reload_slots() {
                tracing::warn!(error = %error, "failed to load slot cache");
            }

            let exit = run_reader_loop(&link, &mut pipeline, &stop_flag);

            commands.detach_and_shutdown();
            set_connected(&health, false);

            match exit {
                ReaderExit::StopRequested => break,
                ReaderExit::ConnectionLost => {
                    tracing::info!(
                        reconnect_delay_ms = config.reconnect_delay_ms,
                        "connection lost, will reconnect"
                    );
                    sleep_unless_stopped(&stop_flag, reconnect_delay);
                }
            }
        }
    })
}

fn set_connected(health: &SharedLinkHealth, connected: bool) {
    if let Ok(mut health) = health.lock() {
        health.connected = connected;
        if !connected {
            health.rssi = None;
        }
    }
}

fn sleep_unless_stopped(stop_flag: &AtomicBool, delay: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < delay {
        if stop_flag.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(step.min(delay - waited));
        waited += step;
    }
}

pub fn run(config: AppConfig) -> Result<(), AppError> {
    let mut connection =
        crate::adapters::db::open_connection(&config.db_path).map_err(AppError::database_init)?;
    crate::adapters::db::run_migrations(&mut connection).map_err(AppError::database_init)?;

    let shared_connection = Arc::new(Mutex::new(connection));
    let service = SqliteSlotService::new(Arc::clone(&shared_connection));

    let health: SharedLinkHealth = Arc::new(Mutex::new(LinkHealth::default()));
    let commands = CommandSender::new();
    let stop_flag = Arc::new(AtomicBool::new(false));

    let (session_tx, session_rx) = std::sync::mpsc::sync_channel(SESSION_QUEUE_CAPACITY);
    let recorder_handle = start_recorder(service.clone(), config.billing, session_rx);
    let monitor_handle = start_monitor(
        config.clone(),
        service.clone(),
        commands.clone(),
        Arc::clone(&health),
        session_tx,
        Arc::clone(&stop_flag),
    );

    let api_state = ApiState {
        service,
        commands: commands.clone(),
        health,
        default_allowed_minutes: config.default_allowed_minutes,
    };

    tracing::info!(bind = %config.http_bind, "http server starting");

    let server_result = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .wrap(Cors::permissive())
                .app_data(web::Data::new(api_state.clone()))
                .configure(configure_routes)
        })
        .bind(&config.http_bind)?
        .run()
        .await
    });

    stop_flag.store(true, Ordering::Relaxed);
    commands.detach_and_shutdown();

    if monitor_handle.join().is_err() {
        return Err(AppError::runtime("device monitor thread panicked"));
    }
    // The monitor owned the last session sender; the recorder drains and
    // exits once it is gone.
    if recorder_handle.join().is_err() {
        return Err(AppError::runtime("session recorder thread panicked"));
    }

    server_result.map_err(AppError::runtime)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::sync_channel;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::{
        Clock, CommandSendError, CommandSender, EventPipeline, LinkHealth, ReaderExit,
        SharedLinkHealth, TimestampMs, build_session_record, run_reader_loop, start_recorder,
        timestamp_to_iso8601,
    };
    use crate::adapters::link::{DeviceLink, TcpDeviceLink};
    use crate::app::services::{SlotCommandHandler, SlotQueryHandler, SqliteSlotService};
    use crate::domain::billing::BillingPolicy;
    use crate::domain::models::NewSlotRecord;
    use crate::domain::occupancy::SessionToRecord;
    use crate::domain::protocol::Command;
    use crate::test_support::open_test_connection;

    struct StepClock {
        values: Vec<i64>,
        index: Cell<usize>,
    }

    impl StepClock {
        fn new(values: Vec<i64>) -> Self {
            Self {
                values,
                index: Cell::new(0),
            }
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> TimestampMs {
            let index = self.index.get();
            self.index.set(index + 1);
            TimestampMs(*self.values.get(index).unwrap_or(&0))
        }
    }

    fn service_with_slot(db_name: &str, slot_name: &str) -> SqliteSlotService {
        let service = SqliteSlotService::new(Arc::new(Mutex::new(open_test_connection(db_name))));
        service
            .add_slot(
                &NewSlotRecord {
                    name: slot_name.to_string(),
                    allowed_minutes: 60,
                },
                "2026-08-26T00:00:00.000Z",
            )
            .expect("slot should be created");
        service
    }

    fn fresh_health() -> SharedLinkHealth {
        Arc::new(Mutex::new(LinkHealth::default()))
    }

    fn pipeline_for<Cl: Clock>(
        clock: Cl,
        service: SqliteSlotService,
        session_tx: std::sync::mpsc::SyncSender<SessionToRecord>,
        health: SharedLinkHealth,
    ) -> EventPipeline<Cl, SqliteSlotService> {
        let changes = service.subscribe();
        let mut pipeline = EventPipeline::new(clock, service, 4096, session_tx, changes, health);
        pipeline.reload_slots().expect("slot cache should load");
        pipeline
    }

    #[test]
    fn timestamp_formatting_round_trips() {
        let iso = timestamp_to_iso8601(TimestampMs(1_700_000_000_000));
        assert_eq!(iso, "2023-11-14T22:13:20.000Z");
        assert_eq!(
            super::parse_iso8601_millis(&iso),
            Some(TimestampMs(1_700_000_000_000))
        );
    }

    #[test]
    fn builds_session_record_with_flat_billing() {
        let session = SessionToRecord {
            slot_id: Some("slot-1".to_string()),
            slot_name: "P1".to_string(),
            started_at: TimestampMs(0),
            ended_at: TimestampMs(130 * 60_000),
            allowed_minutes: 120,
        };
        let policy = BillingPolicy::Flat {
            base_fee: 25.0,
            overtime_fee: 100.0,
        };

        let record = build_session_record(&session, &policy, TimestampMs(130 * 60_000));

        assert_eq!(record.duration_minutes, 130);
        assert_eq!(record.amount_charged, 100.0);
        assert!(record.was_overtime);
        assert_eq!(record.started_at, "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn clock_skew_clamps_duration_to_zero() {
        let session = SessionToRecord {
            slot_id: None,
            slot_name: "P1".to_string(),
            started_at: TimestampMs(120_000),
            ended_at: TimestampMs(0),
            allowed_minutes: 60,
        };
        let policy = BillingPolicy::Hourly {
            rate_per_hour: 25.0,
            overtime_rate_per_hour: 50.0,
        };

        let record = build_session_record(&session, &policy, TimestampMs(0));

        assert_eq!(record.duration_minutes, 0);
        assert_eq!(record.amount_charged, 0.0);
        assert!(!record.was_overtime);
    }

    #[test]
    fn pipeline_completes_a_cycle_and_mirrors_status() {
        let service = service_with_slot("pipeline-cycle.sqlite", "P1");
        let (session_tx, session_rx) = sync_channel(8);
        let clock = StepClock::new(vec![
            1_700_000_000_000, // occupied apply
            1_700_000_000_000, // health touch
            1_700_000_060_000, // vacant apply
            1_700_000_060_000, // health touch
        ]);
        let mut pipeline = pipeline_for(clock, service.clone(), session_tx, fresh_health());

        pipeline.handle_chunk(b"SLOT:P1:occupied\n");

        let mid = service.list_slots().expect("list should succeed");
        assert_eq!(mid[0].status.status, "occupied");
        assert_eq!(
            mid[0].status.occupied_since.as_deref(),
            Some("2023-11-14T22:13:20.000Z")
        );

        pipeline.handle_chunk(b"SLOT:P1:vacant\n");

        let after = service.list_slots().expect("list should succeed");
        assert_eq!(after[0].status.status, "vacant");
        assert_eq!(after[0].status.occupied_since, None);

        let session = session_rx.try_recv().expect("one session should be queued");
        assert_eq!(session.slot_name, "P1");
        assert_eq!(session.started_at, TimestampMs(1_700_000_000_000));
        assert_eq!(session.ended_at, TimestampMs(1_700_000_060_000));
        assert!(session_rx.try_recv().is_err());
    }

    #[test]
    fn pipeline_ignores_unknown_slots_and_garbage() {
        let service = service_with_slot("pipeline-unknown.sqlite", "P1");
        let (session_tx, session_rx) = sync_channel(8);
        let clock = StepClock::new(vec![0; 16]);
        let mut pipeline = pipeline_for(clock, service.clone(), session_tx, fresh_health());

        pipeline.handle_chunk(b"SLOT:GHOST:occupied\nnot a line\nSLOT:P1:sideways\n");

        let slots = service.list_slots().expect("list should succeed");
        assert_eq!(slots[0].status.status, "vacant");
        assert!(session_rx.try_recv().is_err());
    }

    #[test]
    fn pipeline_updates_rssi_health() {
        let service = service_with_slot("pipeline-rssi.sqlite", "P1");
        let (session_tx, _session_rx) = sync_channel(8);
        let health = fresh_health();
        let clock = StepClock::new(vec![1_700_000_000_000; 4]);
        let mut pipeline = pipeline_for(clock, service, session_tx, Arc::clone(&health));

        pipeline.handle_chunk(b"RSSI:-64\n");

        let snapshot = health.lock().expect("health lock should work").clone();
        assert_eq!(snapshot.rssi, Some(-64));
        assert!(snapshot.last_event_at.is_some());
    }

    #[test]
    fn pipeline_picks_up_externally_added_slots() {
        let service = service_with_slot("pipeline-changefeed.sqlite", "P1");
        let (session_tx, session_rx) = sync_channel(8);
        let clock = StepClock::new(vec![0; 8]);
        let mut pipeline = pipeline_for(clock, service.clone(), session_tx, fresh_health());

        // Admin adds a slot out of band after the pipeline loaded its cache.
        service
            .add_slot(
                &NewSlotRecord {
                    name: "P2".to_string(),
                    allowed_minutes: 30,
                },
                "2026-08-26T01:00:00.000Z",
            )
            .expect("slot should be created");

        pipeline.handle_chunk(b"SLOT:P2:occupied\n");
        pipeline.handle_chunk(b"SLOT:P2:vacant\n");

        let session = session_rx.try_recv().expect("session for new slot");
        assert_eq!(session.slot_name, "P2");
        assert_eq!(session.allowed_minutes, 30);
    }

    #[test]
    fn recorder_persists_billed_sessions() {
        let service = service_with_slot("recorder.sqlite", "P1");
        let (session_tx, session_rx) = sync_channel(8);
        let policy = BillingPolicy::Flat {
            base_fee: 25.0,
            overtime_fee: 100.0,
        };
        let handle = start_recorder(service.clone(), policy, session_rx);

        session_tx
            .send(SessionToRecord {
                slot_id: None,
                slot_name: "P1".to_string(),
                started_at: TimestampMs(0),
                ended_at: TimestampMs(45 * 60_000),
                allowed_minutes: 60,
            })
            .expect("send should succeed");
        drop(session_tx);
        handle.join().expect("recorder should exit cleanly");

        let latest = service
            .get_latest_session()
            .expect("query should succeed")
            .expect("session should exist");
        assert_eq!(latest.slot_name, "P1");
        assert_eq!(latest.duration_minutes, 45);
        assert_eq!(latest.amount_charged, 25.0);
        assert!(!latest.was_overtime);
    }

    #[test]
    fn command_sender_without_link_reports_not_connected() {
        let commands = CommandSender::new();
        let result = commands.send(&Command::Ping {
            slot_name: "P1".to_string(),
        });
        assert!(matches!(result, Err(CommandSendError::NotConnected)));
    }

    #[test]
    fn reader_loop_persists_session_from_simulated_device() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let port = listener.local_addr().expect("addr should be available").port();

        // Scripted device: occupied, then vacant split across a torn chunk,
        // then disconnect.
        let device = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("device should accept");
            stream
                .write_all(b"SLOT:P1:occupied\nRSSI:-58\n")
                .expect("device write should succeed");
            thread::sleep(Duration::from_millis(50));
            stream
                .write_all(b"SLOT:P1:vac")
                .expect("device write should succeed");
            thread::sleep(Duration::from_millis(50));
            stream.write_all(b"ant\n").expect("device write should succeed");
            thread::sleep(Duration::from_millis(50));
        });

        let service = service_with_slot("reader-loop.sqlite", "P1");
        let (session_tx, session_rx) = sync_channel(8);
        let policy = BillingPolicy::Hourly {
            rate_per_hour: 25.0,
            overtime_rate_per_hour: 50.0,
        };
        let recorder = start_recorder(service.clone(), policy, session_rx);

        let link: Arc<dyn DeviceLink> = Arc::new(
            TcpDeviceLink::connect(&format!("127.0.0.1:{port}"), Duration::from_millis(100))
                .expect("link should connect"),
        );
        let health = fresh_health();
        // Clock calls: occupied apply, health touch, rssi touch, vacant
        // apply, health touch.
        let clock = StepClock::new(vec![
            1_700_000_000_000,
            1_700_000_000_000,
            1_700_000_000_000,
            1_700_003_600_000,
            1_700_003_600_000,
        ]);
        let mut pipeline = pipeline_for(clock, service.clone(), session_tx, Arc::clone(&health));

        let stop_flag = AtomicBool::new(false);
        let exit = run_reader_loop(&link, &mut pipeline, &stop_flag);
        assert_eq!(exit, ReaderExit::ConnectionLost);
        device.join().expect("device thread should finish");

        // Close the channel so the recorder drains and exits.
        drop(pipeline);
        recorder.join().expect("recorder should exit cleanly");

        let latest = service
            .get_latest_session()
            .expect("query should succeed")
            .expect("session should exist");
        assert_eq!(latest.slot_name, "P1");
        assert_eq!(latest.duration_minutes, 60);
        assert_eq!(latest.amount_charged, 25.0);
        assert!(!latest.was_overtime);

        assert_eq!(
            health.lock().expect("health lock should work").rssi,
            Some(-58)
        );
    }
}
