use actix_web::{HttpResponse, web};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::app::runtime::{CommandSendError, CommandSender, SharedLinkHealth};
use crate::app::services::{ServiceError, SlotCommandHandler, SlotQueryHandler, SqliteSlotService};
use crate::domain::models::{NewSlotRecord, ParkingSessionRecord, SlotWithStatus};
use crate::domain::protocol::Command;

const DEFAULT_SESSION_PAGE_SIZE: u32 = 50;
const MAX_SESSION_PAGE_SIZE: u32 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub service: SqliteSlotService,
    pub commands: CommandSender,
    pub health: SharedLinkHealth,
    pub default_allowed_minutes: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SlotResponse {
    id: String,
    name: String,
    allowed_minutes: i64,
    is_disabled: bool,
    status: String,
    occupied_since: Option<String>,
    updated_at: String,
}

impl From<SlotWithStatus> for SlotResponse {
    fn from(row: SlotWithStatus) -> Self {
        Self {
            id: row.slot.id,
            name: row.slot.name,
            allowed_minutes: row.slot.allowed_minutes,
            is_disabled: row.slot.is_disabled,
            status: row.status.status,
            occupied_since: row.status.occupied_since,
            updated_at: row.status.updated_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    id: String,
    slot_id: Option<String>,
    slot_name: String,
    started_at: String,
    ended_at: String,
    duration_minutes: i64,
    amount_charged: f64,
    was_overtime: bool,
}

impl From<ParkingSessionRecord> for SessionResponse {
    fn from(record: ParkingSessionRecord) -> Self {
        Self {
            id: record.id,
            slot_id: record.slot_id,
            slot_name: record.slot_name,
            started_at: record.started_at,
            ended_at: record.ended_at,
            duration_minutes: record.duration_minutes,
            amount_charged: record.amount_charged,
            was_overtime: record.was_overtime,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSlotRequest {
    name: Option<String>,
    allowed_minutes: Option<i64>,
}

#[derive(Deserialize)]
struct SessionListQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
struct ServoRequest {
    degrees: u16,
}

#[derive(Deserialize)]
struct DisplayRequest {
    text: String,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn error_body(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "error": message.into() })
}

fn service_error_response(error: ServiceError) -> HttpResponse {
    tracing::error!(error = %error, "repository operation failed");
    HttpResponse::InternalServerError().json(error_body(error.to_string()))
}

fn command_error_response(error: CommandSendError) -> HttpResponse {
    match error {
        CommandSendError::NotConnected => {
            HttpResponse::ServiceUnavailable().json(error_body("device not connected"))
        }
        CommandSendError::Encode(encode_error) => {
            HttpResponse::BadRequest().json(error_body(encode_error.to_string()))
        }
        other => {
            tracing::warn!(error = %other, "device command failed");
            HttpResponse::BadGateway().json(error_body(other.to_string()))
        }
    }
}

async fn health(state: web::Data<ApiState>) -> HttpResponse {
    match state.service.get_schema_version() {
        Ok(version) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "schemaVersion": version,
        })),
        Err(error) => service_error_response(error),
    }
}

async fn link_status(state: web::Data<ApiState>) -> HttpResponse {
    let Ok(health) = state.health.lock() else {
        return HttpResponse::InternalServerError().json(error_body("health state unavailable"));
    };
    HttpResponse::Ok().json(serde_json::json!({
        "connected": health.connected,
        "rssi": health.rssi,
        "lastEventAt": health.last_event_at,
    }))
}

async fn list_slots(state: web::Data<ApiState>) -> HttpResponse {
    match state.service.list_slots() {
        Ok(rows) => {
            let slots: Vec<SlotResponse> = rows.into_iter().map(SlotResponse::from).collect();
            HttpResponse::Ok().json(slots)
        }
        Err(error) => service_error_response(error),
    }
}

async fn create_slot(
    state: web::Data<ApiState>,
    body: web::Json<CreateSlotRequest>,
) -> HttpResponse {
    let request = body.into_inner();

    let name = match request.name.map(|n| n.trim().to_string()) {
        Some(name) if !name.is_empty() => name,
        _ => match state.service.count_slots() {
            Ok(count) => format!("P{}", count + 1),
            Err(error) => return service_error_response(error),
        },
    };
    // The device stream is colon-delimited; a name with a colon could never
    // round-trip.
    if name.contains([':', '\n', '\r']) {
        return HttpResponse::BadRequest().json(error_body("slot name must not contain ':'"));
    }

    match state.service.get_slot_by_name(&name) {
        Ok(Some(_)) => {
            return HttpResponse::Conflict().json(error_body(format!("slot {name} already exists")));
        }
        Ok(None) => {}
        Err(error) => return service_error_response(error),
    }

    let allowed_minutes = request
        .allowed_minutes
        .filter(|minutes| *minutes > 0)
        .unwrap_or(state.default_allowed_minutes);

    let new_slot = NewSlotRecord {
        name,
        allowed_minutes,
    };
    match state.service.add_slot(&new_slot, &now_iso()) {
        Ok(slot) => HttpResponse::Created().json(serde_json::json!({
            "id": slot.id,
            "name": slot.name,
            "allowedMinutes": slot.allowed_minutes,
            "isDisabled": slot.is_disabled,
        })),
        Err(error) => service_error_response(error),
    }
}

async fn delete_slot(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();
    match state.service.delete_slot(&name) {
        Ok(true) => HttpResponse::NoContent().finish(),
        Ok(false) => HttpResponse::NotFound().json(error_body(format!("no slot named {name}"))),
        Err(error) => service_error_response(error),
    }
}

async fn ping_slot(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();
    match state.service.get_slot_by_name(&name) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HttpResponse::NotFound().json(error_body(format!("no slot named {name}")));
        }
        Err(error) => return service_error_response(error),
    }

    match state.commands.send(&Command::Ping { slot_name: name }) {
        Ok(()) => HttpResponse::Accepted().json(serde_json::json!({ "sent": true })),
        Err(error) => command_error_response(error),
    }
}

async fn enable_slot(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    set_slot_enabled(&state, &path.into_inner(), true)
}

async fn disable_slot(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    set_slot_enabled(&state, &path.into_inner(), false)
}

/// Repository state is authoritative for enable/disable; the device command
/// is best effort and its failure is reported, not fatal.
fn set_slot_enabled(state: &ApiState, name: &str, enabled: bool) -> HttpResponse {
    let slot = match state.service.get_slot_by_name(name) {
        Ok(Some(slot)) => slot,
        Ok(None) => {
            return HttpResponse::NotFound().json(error_body(format!("no slot named {name}")));
        }
        Err(error) => return service_error_response(error),
    };

    let now = now_iso();
    let status = if enabled { "vacant" } else { "disabled" };
    if let Err(error) = state.service.set_disabled(&slot.id, !enabled, &now) {
        return service_error_response(error);
    }
    if let Err(error) = state.service.update_status(&slot.id, status, None, &now) {
        return service_error_response(error);
    }

    let device_notified = match state.commands.send(&Command::SetEnabled {
        slot_name: name.to_string(),
        enabled,
    }) {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(slot = %name, error = %error, "device not notified of enable change");
            false
        }
    };

    HttpResponse::Ok().json(serde_json::json!({
        "name": name,
        "status": status,
        "deviceNotified": device_notified,
    }))
}

async fn set_servo(state: web::Data<ApiState>, body: web::Json<ServoRequest>) -> HttpResponse {
    match state.commands.send(&Command::SetServoAngle {
        degrees: body.degrees,
    }) {
        Ok(()) => HttpResponse::Accepted().json(serde_json::json!({ "sent": true })),
        Err(error) => command_error_response(error),
    }
}

async fn set_display(state: web::Data<ApiState>, body: web::Json<DisplayRequest>) -> HttpResponse {
    match state.commands.send(&Command::SetDisplayText {
        text: body.into_inner().text,
    }) {
        Ok(()) => HttpResponse::Accepted().json(serde_json::json!({ "sent": true })),
        Err(error) => command_error_response(error),
    }
}

async fn list_sessions(
    state: web::Data<ApiState>,
    query: web::Query<SessionListQuery>,
) -> HttpResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SESSION_PAGE_SIZE)
        .clamp(1, MAX_SESSION_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);

    let sessions = match state.service.list_sessions(limit, offset) {
        Ok(sessions) => sessions,
        Err(error) => return service_error_response(error),
    };
    let total = match state.service.count_sessions() {
        Ok(total) => total,
        Err(error) => return service_error_response(error),
    };

    let sessions: Vec<SessionResponse> = sessions.into_iter().map(SessionResponse::from).collect();
    HttpResponse::Ok().json(serde_json::json!({
        "sessions": sessions,
        "total": total,
    }))
}

async fn latest_session(state: web::Data<ApiState>) -> HttpResponse {
    match state.service.get_latest_session() {
        Ok(Some(session)) => HttpResponse::Ok().json(SessionResponse::from(session)),
        Ok(None) => HttpResponse::NotFound().json(error_body("no sessions recorded yet")),
        Err(error) => service_error_response(error),
    }
}

async fn today_stats(state: web::Data<ApiState>) -> HttpResponse {
    let start_of_day = Utc::now()
        .date_naive()
        .and_time(chrono::NaiveTime::MIN)
        .and_utc();
    let end_of_day = start_of_day + chrono::Duration::days(1);
    let from = start_of_day.to_rfc3339_opts(SecondsFormat::Millis, true);
    let to = end_of_day.to_rfc3339_opts(SecondsFormat::Millis, true);

    match state.service.session_stats_between(&from, &to) {
        Ok((count, revenue)) => HttpResponse::Ok().json(serde_json::json!({
            "date": start_of_day.date_naive().to_string(),
            "sessions": count,
            "revenue": revenue,
        })),
        Err(error) => service_error_response(error),
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/status", web::get().to(link_status))
        .route("/slots", web::get().to(list_slots))
        .route("/slots", web::post().to(create_slot))
        .route("/slots/{name}", web::delete().to(delete_slot))
        .route("/slots/{name}/ping", web::post().to(ping_slot))
        .route("/slots/{name}/enable", web::post().to(enable_slot))
        .route("/slots/{name}/disable", web::post().to(disable_slot))
        .route("/device/servo", web::post().to(set_servo))
        .route("/device/display", web::post().to(set_display))
        .route("/sessions", web::get().to(list_sessions))
        .route("/sessions/latest", web::get().to(latest_session))
        .route("/stats/today", web::get().to(today_stats));
}
