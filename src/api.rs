//! HTTP API handlers for the CAD console.
//!
//! Every request after login carries the session token in the
//! `x-cad-session` header. The role bound to that session decides which
//! dashboard a caller gets and which actions it may take; nothing in a
//! request body can change it.
//!
//! Failures are logged at `warn` with the error and mapped to a status code
//! by [`Error::status_code`].

use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, patch, post},
};
use chrono::Utc;
use futures_util::stream::{Stream, unfold};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::dashboard::{DashboardFeed, DashboardView, bolo_view, load_dashboard};
use crate::derived::BoloBoard;
use crate::error::Error;
use crate::model::{
    AssignUnitRequest, Bolo, EditIncidentRequest, ForceStatusRequest, GeoPoint, Incident,
    NewBoloRequest, NewIncidentRequest, Note, NoteRequest, RadioChannel, RadioMessage,
    RadioMessageRequest, RespondingCodeRequest, ShiftLogEntry, ShiftNoteRequest, StatusRequest,
    Unit,
};
use crate::operations;
use crate::roles::{Capability, DashboardKind, LoginRequest, Role, Session, SessionStore};
use crate::storage::Storage;

/// Header carrying the session token.
pub const SESSION_HEADER: &str = "x-cad-session";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub sessions: SessionStore,
}

/// Build the console router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/session", post(login).delete(logout))
        .route("/dashboard", get(get_dashboard))
        .route("/dashboard/stream", get(dashboard_stream))
        .route("/incidents", post(create_incident))
        .route("/incidents/:id", patch(edit_incident).delete(delete_incident))
        .route("/incidents/:id/assign", post(assign_unit))
        .route("/incidents/:id/complete", post(complete_call))
        .route("/incidents/:id/close", post(close_incident))
        .route("/incidents/:id/notes", post(add_note))
        .route("/incidents/:id/code-red", post(toggle_code_red))
        .route("/incidents/:id/responding-code", post(set_responding_code))
        .route("/units/me/status", post(change_status))
        .route("/units/me/backup", post(request_backup))
        .route("/units/me/break", post(start_break))
        .route("/units/me/location", post(report_location))
        .route("/units/me/channels/:channel", post(toggle_channel))
        .route("/units/:id/force-status", post(force_status))
        .route("/units/:id/kick", post(kick_unit))
        .route("/bolos", get(get_bolos).post(create_bolo))
        .route("/bolos/:id/resolve", post(resolve_bolo))
        .route("/radio/:channel", get(get_radio).post(send_radio))
        .route("/radio/messages/:id", delete(delete_radio))
        .route("/shift-log", get(get_shift_log).post(add_shift_note))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the caller's session from the request headers.
async fn current_session(state: &AppState, headers: &HeaderMap) -> Result<Session, StatusCode> {
    let token = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            warn!("Request without session header");
            StatusCode::UNAUTHORIZED
        })?;

    state.sessions.resolve(token).await.map_err(|e| {
        warn!(error = %e, "Unknown session token");
        e.status_code()
    })
}

/// Log a failed operation and map it to a status code.
fn reject(action: &'static str, e: Error) -> StatusCode {
    warn!(action, error = %e, "Request failed");
    e.status_code()
}

fn parse_channel(channel: &str) -> Result<RadioChannel, StatusCode> {
    channel.parse().map_err(|e| reject("parse radio channel", e))
}

pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Sessions
// ============================================================================

/// Response body for POST /session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub identity: String,
    pub role: Role,
    pub dashboard: DashboardKind,
    pub capabilities: &'static [Capability],
    pub server_id: String,
}

/// POST /session - Log in as dispatch, a unit or a supervisor.
///
/// # Request Body
///
/// ```json
/// {
///     "identifier": "12",
///     "role": "unit"
/// }
/// ```
///
/// Supervisors must also send `"credential"`, checked against the key
/// configured for the service. A unit login brings the unit on shift.
#[instrument(skip(state, request), fields(role = request.role.as_str()))]
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<(StatusCode, Json<LoginResponse>), StatusCode> {
    let now = Utc::now();

    let session = match state.sessions.login(&request, now).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Login refused");
            return Err(e.status_code());
        }
    };

    if session.role == Role::Unit {
        if let Err(e) = operations::start_shift(&state.storage, &session, now).await {
            warn!(unit = %session.identity, error = %e, "Failed to start shift");
            let _ = state.sessions.logout(&session.token).await;
            return Err(e.status_code());
        }
    }

    info!(identity = %session.identity, "Session started");
    Ok((
        StatusCode::CREATED,
        Json(LoginResponse {
            dashboard: session.role.dashboard(),
            capabilities: session.role.capabilities(),
            server_id: state.storage.namespace().to_string(),
            token: session.token,
            identity: session.identity,
            role: session.role,
        }),
    ))
}

/// DELETE /session - Log out. A unit goes offline.
#[instrument(skip(state, headers))]
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let session = match current_session(&state, &headers).await {
        Ok(session) => session,
        Err(status) => return status,
    };

    if session.role == Role::Unit {
        if let Err(e) = operations::end_shift(&state.storage, &session, Utc::now()).await {
            warn!(unit = %session.identity, error = %e, "Failed to end shift");
        }
    }

    match state.sessions.logout(&session.token).await {
        Ok(_) => {
            info!(identity = %session.identity, role = session.role.as_str(), "Session ended");
            StatusCode::NO_CONTENT
        }
        Err(e) => reject("logout", e),
    }
}

// ============================================================================
// Dashboards
// ============================================================================

/// GET /dashboard - The caller's role view, built once.
#[instrument(skip(state, headers))]
pub async fn get_dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DashboardView>, StatusCode> {
    let session = current_session(&state, &headers).await?;
    let role = session.role;

    match load_dashboard(&state.storage, session).await {
        Ok(Some(view)) => {
            info!(role = role.as_str(), "Dashboard queried");
            Ok(Json(view))
        }
        Ok(None) => {
            warn!(role = role.as_str(), "Change feed closed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(e) => Err(reject("load dashboard", e)),
    }
}

/// GET /dashboard/stream - The caller's role view as Server-Sent Events.
///
/// One `dashboard` event is sent on connect and another after every change
/// to the underlying queries. The feed's subscriptions are released when the
/// client disconnects.
#[instrument(skip(state, headers))]
pub async fn dashboard_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let session = current_session(&state, &headers).await?;
    info!(role = session.role.as_str(), identity = %session.identity, "Dashboard stream opened");

    let feed = DashboardFeed::open(&state.storage, session);
    let stream = unfold(feed, |mut feed| async move {
        let view = match feed.next().await {
            Ok(Some(view)) => view,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Dashboard stream ended");
                return None;
            }
        };

        let event = match Event::default()
            .event("dashboard")
            .id(feed.revision().to_string())
            .json_data(&view)
        {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Failed to encode dashboard event");
                return None;
            }
        };
        Some((Ok::<Event, Infallible>(event), feed))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Incidents
// ============================================================================

/// POST /incidents - Open a call.
///
/// Calls from dispatch or a supervisor start `pending`; a unit's own call is
/// dispatched to that unit.
#[instrument(skip(state, headers))]
pub async fn create_incident(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NewIncidentRequest>,
) -> Result<(StatusCode, Json<Incident>), StatusCode> {
    let session = current_session(&state, &headers).await?;

    match operations::create_incident(&state.storage, &session, request, Utc::now()).await {
        Ok(incident) => {
            info!(incident = %incident.id, status = %incident.status, "Incident created");
            Ok((StatusCode::CREATED, Json(incident)))
        }
        Err(e) => {
            warn!(role = session.role.as_str(), error = %e, "Failed to create incident");
            Err(e.status_code())
        }
    }
}

/// PATCH /incidents/:id - Edit call details.
#[instrument(skip(state, headers))]
pub async fn edit_incident(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<EditIncidentRequest>,
) -> Result<Json<Incident>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::edit_incident(&state.storage, &session, &id, request, Utc::now())
        .await
        .map(Json)
        .map_err(|e| reject("edit incident", e))
}

/// POST /incidents/:id/assign - Assign a unit.
///
/// Returns `409 Conflict` when the unit is already on another dispatched
/// call, or is offline.
#[instrument(skip(state, headers))]
pub async fn assign_unit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<AssignUnitRequest>,
) -> Result<Json<Incident>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    match operations::assign_unit(&state.storage, &session, &id, &request.unit, Utc::now()).await {
        Ok(incident) => {
            info!(incident = %id, unit = %request.unit, "Unit assigned");
            Ok(Json(incident))
        }
        Err(e) => {
            warn!(incident = %id, unit = %request.unit, error = %e, "Failed to assign unit");
            Err(e.status_code())
        }
    }
}

/// POST /incidents/:id/complete - A unit completes its call.
#[instrument(skip(state, headers))]
pub async fn complete_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Incident>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::complete_call(&state.storage, &session, &id, Utc::now())
        .await
        .map(Json)
        .map_err(|e| reject("complete call", e))
}

/// POST /incidents/:id/close - Dispatch or a supervisor closes a call.
#[instrument(skip(state, headers))]
pub async fn close_incident(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Incident>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::close_incident(&state.storage, &session, &id, Utc::now())
        .await
        .map(Json)
        .map_err(|e| reject("close incident", e))
}

/// DELETE /incidents/:id - Dispatch or a supervisor removes a call in any
/// status. Busy units on it return to service.
#[instrument(skip(state, headers))]
pub async fn delete_incident(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> StatusCode {
    let session = match current_session(&state, &headers).await {
        Ok(session) => session,
        Err(status) => return status,
    };

    match operations::delete_incident(&state.storage, &session, &id, Utc::now()).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => reject("delete incident", e),
    }
}

/// POST /incidents/:id/notes - Append a note.
#[instrument(skip(state, headers))]
pub async fn add_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<NoteRequest>,
) -> Result<(StatusCode, Json<Note>), StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::add_note(&state.storage, &session, &id, request, Utc::now())
        .await
        .map(|note| (StatusCode::CREATED, Json(note)))
        .map_err(|e| reject("add note", e))
}

/// POST /incidents/:id/code-red - Toggle Code Red.
#[instrument(skip(state, headers))]
pub async fn toggle_code_red(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::toggle_code_red(&state.storage, &session, &id, Utc::now())
        .await
        .map(|code_red| Json(json!({ "codeRed": code_red })))
        .map_err(|e| reject("toggle code red", e))
}

/// POST /incidents/:id/responding-code - Set the responding code (1-3).
#[instrument(skip(state, headers))]
pub async fn set_responding_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<RespondingCodeRequest>,
) -> StatusCode {
    let session = match current_session(&state, &headers).await {
        Ok(session) => session,
        Err(status) => return status,
    };

    match operations::set_responding_code(&state.storage, &session, &id, request.code, Utc::now())
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => reject("set responding code", e),
    }
}

// ============================================================================
// Units
// ============================================================================

/// POST /units/me/status - Change the caller's unit status.
#[instrument(skip(state, headers))]
pub async fn change_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StatusRequest>,
) -> Result<Json<Unit>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::change_status(&state.storage, &session, request.status, Utc::now())
        .await
        .map(Json)
        .map_err(|e| reject("change status", e))
}

/// POST /units/me/backup - Request backup on the active call.
#[instrument(skip(state, headers))]
pub async fn request_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::request_backup(&state.storage, &session, Utc::now())
        .await
        .map(|incident_id| Json(json!({ "incidentId": incident_id })))
        .map_err(|e| reject("request backup", e))
}

/// POST /units/me/break
#[instrument(skip(state, headers))]
pub async fn start_break(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let session = match current_session(&state, &headers).await {
        Ok(session) => session,
        Err(status) => return status,
    };

    match operations::start_break(&state.storage, &session, Utc::now()).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => reject("start break", e),
    }
}

/// POST /units/me/location
#[instrument(skip(state, headers))]
pub async fn report_location(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(location): Json<GeoPoint>,
) -> StatusCode {
    let session = match current_session(&state, &headers).await {
        Ok(session) => session,
        Err(status) => return status,
    };

    match operations::report_location(&state.storage, &session, location, Utc::now()).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => reject("report location", e),
    }
}

/// POST /units/me/channels/:channel - Join or leave a radio channel.
#[instrument(skip(state, headers))]
pub async fn toggle_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<String>,
) -> Result<Json<Vec<RadioChannel>>, StatusCode> {
    let session = current_session(&state, &headers).await?;
    let channel = parse_channel(&channel)?;

    operations::toggle_channel(&state.storage, &session, channel, Utc::now())
        .await
        .map(Json)
        .map_err(|e| reject("toggle channel", e))
}

/// POST /units/:id/force-status - Supervisor status override.
#[instrument(skip(state, headers))]
pub async fn force_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(unit): Path<String>,
    Json(request): Json<ForceStatusRequest>,
) -> Result<Json<Unit>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::force_status(&state.storage, &session, &unit, request, Utc::now())
        .await
        .map(Json)
        .map_err(|e| reject("force status", e))
}

/// POST /units/:id/kick - Dispatch removes a unit from the shift and ends
/// its sessions.
#[instrument(skip(state, headers))]
pub async fn kick_unit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(unit): Path<String>,
) -> StatusCode {
    let session = match current_session(&state, &headers).await {
        Ok(session) => session,
        Err(status) => return status,
    };

    match operations::kick_unit(&state.storage, &session, &unit, Utc::now()).await {
        Ok(()) => {
            let revoked = state.sessions.revoke_unit(&unit).await;
            info!(unit = %unit, revoked, "Unit kicked");
            StatusCode::NO_CONTENT
        }
        Err(e) => reject("kick unit", e),
    }
}

// ============================================================================
// BOLOs
// ============================================================================

/// GET /bolos - Active, resolved and expired BOLOs.
#[instrument(skip(state, headers))]
pub async fn get_bolos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BoloBoard>, StatusCode> {
    current_session(&state, &headers).await?;

    match bolo_view(&state.storage, Utc::now()).await {
        Ok(board) => {
            info!(
                active = board.active.len(),
                resolved = board.resolved.len(),
                expired = board.expired.len(),
                "BOLOs queried"
            );
            Ok(Json(board))
        }
        Err(e) => Err(reject("list bolos", e)),
    }
}

/// POST /bolos
#[instrument(skip(state, headers))]
pub async fn create_bolo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NewBoloRequest>,
) -> Result<(StatusCode, Json<Bolo>), StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::create_bolo(&state.storage, &session, request, Utc::now())
        .await
        .map(|bolo| (StatusCode::CREATED, Json(bolo)))
        .map_err(|e| reject("create bolo", e))
}

/// POST /bolos/:id/resolve
#[instrument(skip(state, headers))]
pub async fn resolve_bolo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Bolo>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::resolve_bolo(&state.storage, &session, &id, Utc::now())
        .await
        .map(Json)
        .map_err(|e| reject("resolve bolo", e))
}

// ============================================================================
// Radio
// ============================================================================

/// GET /radio/:channel - Channel traffic, newest first.
#[instrument(skip(state, headers))]
pub async fn get_radio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<String>,
) -> Result<Json<Vec<RadioMessage>>, StatusCode> {
    let session = current_session(&state, &headers).await?;
    let channel = parse_channel(&channel)?;

    operations::channel_messages(&state.storage, &session, channel)
        .await
        .map(Json)
        .map_err(|e| reject("read radio", e))
}

/// POST /radio/:channel
#[instrument(skip(state, headers))]
pub async fn send_radio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<String>,
    Json(request): Json<RadioMessageRequest>,
) -> Result<(StatusCode, Json<RadioMessage>), StatusCode> {
    let session = current_session(&state, &headers).await?;
    let channel = parse_channel(&channel)?;

    operations::send_radio_message(&state.storage, &session, channel, request, Utc::now())
        .await
        .map(|message| (StatusCode::CREATED, Json(message)))
        .map_err(|e| reject("send radio", e))
}

/// DELETE /radio/messages/:id - Dispatch and supervisors only.
#[instrument(skip(state, headers))]
pub async fn delete_radio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> StatusCode {
    let session = match current_session(&state, &headers).await {
        Ok(session) => session,
        Err(status) => return status,
    };

    match operations::delete_radio_message(&state.storage, &session, &id).await {
        Ok(_) => StatusCode::NO_CONTENT,
        Err(e) => reject("delete radio message", e),
    }
}

// ============================================================================
// Shift log
// ============================================================================

/// GET /shift-log - Today's entries for the caller's unit.
#[instrument(skip(state, headers))]
pub async fn get_shift_log(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ShiftLogEntry>>, StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::shift_log(&state.storage, &session, Utc::now())
        .await
        .map(Json)
        .map_err(|e| reject("read shift log", e))
}

/// POST /shift-log
#[instrument(skip(state, headers))]
pub async fn add_shift_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ShiftNoteRequest>,
) -> Result<(StatusCode, Json<ShiftLogEntry>), StatusCode> {
    let session = current_session(&state, &headers).await?;

    operations::add_shift_note(&state.storage, &session, request, Utc::now())
        .await
        .map(|entry| (StatusCode::CREATED, Json(entry)))
        .map_err(|e| reject("add shift note", e))
}
