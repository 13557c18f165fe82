//! Console operations.
//!
//! Every mutation the console performs goes through a function here. Each
//! takes the caller's [`Session`], checks the role's capability table, reads
//! what it needs from the store and writes the resulting field updates back.
//! Store failures are returned to the caller as-is; nothing retries.
//!
//! Invariants checked before writing:
//!
//! - incidents only move `pending -> dispatched -> resolved`
//! - a unit works at most one dispatched incident at a time
//! - responding codes are 1-3 and radio messages are non-blank

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::derived::{active_incident_for, incidents_for_unit, sort_newest_first};
use crate::error::{Error, Result};
use crate::model::{
    Bolo, BoloStatus, EditIncidentRequest, ForceStatusRequest, GeoPoint, Incident, IncidentStatus,
    NewBoloRequest, NewIncidentRequest, Note, NoteRequest, NoteType, RadioChannel, RadioMessage,
    RadioMessageRequest, RespondingCode, ShiftLogEntry, ShiftLogKind, ShiftNoteRequest, Unit,
    UnitStatus,
};
use crate::roles::{Capability, Role, Session};
use crate::storage::{
    BOLOS, Fields, INCIDENTS, RADIO_MESSAGES, SHIFT_LOGS, Storage, UNITS, to_fields,
};

const DEFAULT_OVERRIDE_REASON: &str = "Supervisor override";
const PANIC_NOTE: &str = "PANIC BUTTON ACTIVATED";
const BACKUP_NOTE: &str = "BACKUP REQUESTED";

fn fields(value: Value) -> Result<Fields> {
    to_fields(&value)
}

fn require_text(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn check_transition(incident: &Incident, next: IncidentStatus) -> Result<()> {
    if incident.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: incident.status,
            to: next,
        })
    }
}

/// Incidents, newest first.
async fn incidents_newest_first(storage: &Storage) -> Result<Vec<Incident>> {
    let mut incidents = storage.list::<Incident>(INCIDENTS).await?;
    sort_newest_first(&mut incidents);
    Ok(incidents)
}

/// The dispatched incident a unit is working, if any.
pub async fn active_incident(storage: &Storage, unit: &str) -> Result<Option<Incident>> {
    let incidents = incidents_newest_first(storage).await?;
    Ok(active_incident_for(unit, &incidents).cloned())
}

/// Fail with `Conflict` if `unit` already works a dispatched incident other
/// than `except`.
fn ensure_unassigned(incidents: &[Incident], unit: &str, except: Option<&str>) -> Result<()> {
    let busy_on = incidents_for_unit(unit, incidents)
        .into_iter()
        .find(|incident| Some(incident.id.as_str()) != except);

    match busy_on {
        Some(incident) => Err(Error::Conflict(format!(
            "unit {unit} is already assigned to incident {}",
            incident.id
        ))),
        None => Ok(()),
    }
}

fn ensure_open(incident: &Incident) -> Result<()> {
    if incident.status == IncidentStatus::Resolved {
        return Err(Error::Conflict(format!("incident {} is resolved", incident.id)));
    }
    Ok(())
}

async fn set_unit_status(
    storage: &Storage,
    unit: &str,
    status: UnitStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    storage
        .update(
            UNITS,
            unit,
            fields(json!({ "status": status, "lastUpdated": now }))?,
        )
        .await
}

async fn append_note(
    storage: &Storage,
    incident_id: &str,
    note: &Note,
    also: Value,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut also = fields(also)?;
    also.insert("updatedAt".to_string(), serde_json::to_value(now)?);

    storage
        .array_union(
            INCIDENTS,
            incident_id,
            "notes",
            vec![serde_json::to_value(note)?],
            also,
        )
        .await
}

/// Return the busy units on `incident` to service.
async fn release_units(storage: &Storage, incident: &Incident, now: DateTime<Utc>) -> Result<()> {
    for unit in &incident.assigned_units {
        match storage.get::<Unit>(UNITS, unit).await? {
            Some(assigned) if assigned.status == UnitStatus::Busy => {
                set_unit_status(storage, unit, UnitStatus::Available, now).await?;
            }
            Some(_) => {}
            None => warn!(incident = %incident.id, unit = %unit, "Assigned unit has no document"),
        }
    }
    Ok(())
}

/// Append an entry to a unit's shift log.
pub async fn log_shift_activity(
    storage: &Storage,
    unit: &str,
    kind: ShiftLogKind,
    description: &str,
    now: DateTime<Utc>,
) -> Result<ShiftLogEntry> {
    let mut entry = ShiftLogEntry {
        id: String::new(),
        unit_number: unit.to_string(),
        timestamp: Some(now),
        kind,
        description: description.to_string(),
    };
    entry.id = storage.insert(SHIFT_LOGS, to_fields(&entry)?).await?;
    Ok(entry)
}

// ============================================================================
// Unit session lifecycle
// ============================================================================

/// Bring a unit on shift after login.
///
/// Merges over any previous document for the unit number so a returning unit
/// keeps its type and history, and clears an earlier kick.
pub async fn start_shift(storage: &Storage, session: &Session, now: DateTime<Utc>) -> Result<Unit> {
    let unit = session.unit_number()?;

    let existing: Option<Unit> = storage.get(UNITS, unit).await?;
    let unit_type = existing
        .as_ref()
        .map(|u| u.unit_type.clone())
        .unwrap_or_else(|| "patrol".to_string());

    storage
        .upsert(
            UNITS,
            unit,
            fields(json!({
                "unitNumber": unit,
                "type": unit_type,
                "status": UnitStatus::Available,
                "lastUpdated": now,
                "kickedBy": null,
                "kickedAt": null,
                "activeChannels": [RadioChannel::Dispatch],
            }))?,
            true,
        )
        .await?;
    log_shift_activity(
        storage,
        unit,
        ShiftLogKind::Status,
        "Unit initialized and started shift",
        now,
    )
    .await?;

    info!(unit = %unit, "Unit started shift");
    storage.require(UNITS, unit).await
}

/// Take a unit off shift at logout.
pub async fn end_shift(storage: &Storage, session: &Session, now: DateTime<Utc>) -> Result<()> {
    let unit = session.unit_number()?;

    set_unit_status(storage, unit, UnitStatus::Offline, now).await?;
    log_shift_activity(storage, unit, ShiftLogKind::Status, "End of shift", now).await?;

    info!(unit = %unit, "Unit ended shift");
    Ok(())
}

// ============================================================================
// Incidents
// ============================================================================

/// Open a call.
///
/// A unit's own call is dispatched straight to that unit, which goes busy.
/// Calls from dispatch or a supervisor wait in `pending` for assignment.
pub async fn create_incident(
    storage: &Storage,
    session: &Session,
    request: NewIncidentRequest,
    now: DateTime<Utc>,
) -> Result<Incident> {
    session.require(Capability::CreateIncident)?;

    let incident_type = require_text(&request.incident_type, "type")?;
    let location = require_text(&request.location, "location")?;

    let (status, assigned_units) = match session.role {
        Role::Unit => {
            let unit = session.unit_number()?;
            (IncidentStatus::Dispatched, vec![unit.to_string()])
        }
        Role::Dispatch | Role::Supervisor => (IncidentStatus::Pending, Vec::new()),
    };

    let mut incident = Incident {
        id: String::new(),
        incident_type,
        location,
        description: request.description.trim().to_string(),
        priority: request.priority,
        status,
        timestamp: Some(now),
        assigned_units,
        dispatcher_id: session.dispatcher_id(),
        notes: Vec::new(),
        code_red: false,
        responding_code: RespondingCode::CODE_2,
        backup_requested: false,
        panic_status: false,
        created_at: Some(now),
        updated_at: Some(now),
    };
    let document = to_fields(&incident)?;
    incident.id = match session.role {
        Role::Unit => {
            let unit = session.unit_number()?;
            storage
                .insert_checked::<Incident, _>(INCIDENTS, document, |incidents| {
                    ensure_unassigned(incidents, unit, None)
                })
                .await?
        }
        Role::Dispatch | Role::Supervisor => storage.insert(INCIDENTS, document).await?,
    };

    if session.role == Role::Unit {
        let unit = session.unit_number()?;
        set_unit_status(storage, unit, UnitStatus::Busy, now).await?;
        log_shift_activity(
            storage,
            unit,
            ShiftLogKind::Incident,
            &format!("Created new call: {}", incident.incident_type),
            now,
        )
        .await?;
    }

    info!(
        incident = %incident.id,
        status = %incident.status,
        by = %incident.dispatcher_id,
        "Incident created"
    );
    Ok(incident)
}

/// Change an incident's type, location, description or priority.
pub async fn edit_incident(
    storage: &Storage,
    session: &Session,
    incident_id: &str,
    request: EditIncidentRequest,
    now: DateTime<Utc>,
) -> Result<Incident> {
    session.require(Capability::EditIncident)?;
    let incident: Incident = storage.require(INCIDENTS, incident_id).await?;
    ensure_open(&incident)?;

    let mut update = Fields::new();
    if let Some(value) = &request.incident_type {
        update.insert("type".to_string(), Value::String(require_text(value, "type")?));
    }
    if let Some(value) = &request.location {
        update.insert(
            "location".to_string(),
            Value::String(require_text(value, "location")?),
        );
    }
    if let Some(value) = &request.description {
        update.insert(
            "description".to_string(),
            Value::String(value.trim().to_string()),
        );
    }
    if let Some(priority) = request.priority {
        update.insert("priority".to_string(), serde_json::to_value(priority)?);
    }
    update.insert("updatedAt".to_string(), serde_json::to_value(now)?);

    storage.update(INCIDENTS, incident_id, update).await?;
    info!(incident = %incident_id, "Incident edited");
    storage.require(INCIDENTS, incident_id).await
}

/// Assign a unit to an incident.
///
/// Moves the incident to `dispatched` and the unit to `busy`. A unit already
/// on another dispatched incident is refused. The check and the assignment
/// commit together, so concurrent assignments of one unit cannot both pass.
pub async fn assign_unit(
    storage: &Storage,
    session: &Session,
    incident_id: &str,
    unit: &str,
    now: DateTime<Utc>,
) -> Result<Incident> {
    session.require(Capability::AssignUnit)?;
    let unit = require_text(unit, "unit")?;

    let target: Unit = storage.require(UNITS, &unit).await?;
    if target.status == UnitStatus::Offline {
        return Err(Error::Conflict(format!("unit {unit} is offline")));
    }

    storage
        .array_union_checked::<Incident, _>(
            INCIDENTS,
            incident_id,
            "assignedUnits",
            vec![Value::String(unit.clone())],
            fields(json!({ "status": IncidentStatus::Dispatched, "updatedAt": now }))?,
            |incidents| {
                let incident = incidents
                    .iter()
                    .find(|incident| incident.id == incident_id)
                    .ok_or_else(|| Error::not_found(INCIDENTS, incident_id))?;
                check_transition(incident, IncidentStatus::Dispatched)?;
                ensure_unassigned(incidents, &unit, Some(incident_id))
            },
        )
        .await?;
    set_unit_status(storage, &unit, UnitStatus::Busy, now).await?;

    info!(incident = %incident_id, unit = %unit, "Unit assigned");
    storage.require(INCIDENTS, incident_id).await
}

/// A unit completes the call it is working.
pub async fn complete_call(
    storage: &Storage,
    session: &Session,
    incident_id: &str,
    now: DateTime<Utc>,
) -> Result<Incident> {
    session.require(Capability::CompleteCall)?;
    let unit = session.unit_number()?;

    let incident: Incident = storage.require(INCIDENTS, incident_id).await?;
    if !incident.is_assigned_to(unit) {
        return Err(Error::Forbidden {
            role: session.role.as_str().to_string(),
            action: format!("complete incident {incident_id} it is not assigned to"),
        });
    }
    check_transition(&incident, IncidentStatus::Resolved)?;

    storage
        .update(
            INCIDENTS,
            incident_id,
            fields(json!({ "status": IncidentStatus::Resolved, "updatedAt": now }))?,
        )
        .await?;
    set_unit_status(storage, unit, UnitStatus::Available, now).await?;
    log_shift_activity(
        storage,
        unit,
        ShiftLogKind::Incident,
        &format!("Completed call: {}", incident.incident_type),
        now,
    )
    .await?;

    info!(incident = %incident_id, unit = %unit, "Call completed");
    storage.require(INCIDENTS, incident_id).await
}

/// Dispatch or a supervisor closes a dispatched call. Busy units on it are
/// returned to service.
pub async fn close_incident(
    storage: &Storage,
    session: &Session,
    incident_id: &str,
    now: DateTime<Utc>,
) -> Result<Incident> {
    session.require(Capability::CloseIncident)?;

    let incident: Incident = storage.require(INCIDENTS, incident_id).await?;
    check_transition(&incident, IncidentStatus::Resolved)?;

    storage
        .update(
            INCIDENTS,
            incident_id,
            fields(json!({ "status": IncidentStatus::Resolved, "updatedAt": now }))?,
        )
        .await?;

    release_units(storage, &incident, now).await?;

    info!(incident = %incident_id, by = %session.role.as_str(), "Incident closed");
    storage.require(INCIDENTS, incident_id).await
}

/// Dispatch or a supervisor removes a call in any status, for duplicates and
/// calls opened in error. Busy units on it are returned to service.
pub async fn delete_incident(
    storage: &Storage,
    session: &Session,
    incident_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    session.require(Capability::CloseIncident)?;

    let incident: Incident = storage.require(INCIDENTS, incident_id).await?;
    storage.delete(INCIDENTS, incident_id).await?;
    release_units(storage, &incident, now).await?;

    info!(
        incident = %incident_id,
        status = %incident.status,
        by = %session.role.as_str(),
        "Incident removed"
    );
    Ok(())
}

/// Append a note to an incident. Units may only note calls they are on.
pub async fn add_note(
    storage: &Storage,
    session: &Session,
    incident_id: &str,
    request: NoteRequest,
    now: DateTime<Utc>,
) -> Result<Note> {
    session.require(Capability::AddNote)?;
    let text = require_text(&request.text, "text")?;

    let incident: Incident = storage.require(INCIDENTS, incident_id).await?;
    if session.role == Role::Unit && !incident.is_assigned_to(&session.identity) {
        return Err(Error::Forbidden {
            role: session.role.as_str().to_string(),
            action: format!("add notes to incident {incident_id}"),
        });
    }

    let note = Note::new(
        text,
        session.note_author(),
        request.note_type.unwrap_or_else(|| session.default_note_type()),
        now,
    );
    append_note(storage, incident_id, &note, json!({}), now).await?;

    info!(incident = %incident_id, author = %note.author, "Note added");
    Ok(note)
}

/// Flip the Code Red flag and return its new value.
pub async fn toggle_code_red(
    storage: &Storage,
    session: &Session,
    incident_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    session.require(Capability::ToggleCodeRed)?;

    let incident: Incident = storage.require(INCIDENTS, incident_id).await?;
    ensure_open(&incident)?;
    let code_red = !incident.code_red;
    storage
        .update(
            INCIDENTS,
            incident_id,
            fields(json!({ "codeRed": code_red, "updatedAt": now }))?,
        )
        .await?;

    info!(incident = %incident_id, code_red, "Code Red toggled");
    Ok(code_red)
}

pub async fn set_responding_code(
    storage: &Storage,
    session: &Session,
    incident_id: &str,
    code: RespondingCode,
    now: DateTime<Utc>,
) -> Result<()> {
    session.require(Capability::SetRespondingCode)?;
    let incident: Incident = storage.require(INCIDENTS, incident_id).await?;
    ensure_open(&incident)?;

    storage
        .update(
            INCIDENTS,
            incident_id,
            fields(json!({ "respondingCode": code, "updatedAt": now }))?,
        )
        .await?;

    info!(incident = %incident_id, code = code.value(), "Responding code set");
    Ok(())
}

// ============================================================================
// Unit status
// ============================================================================

/// A unit changes its own status.
///
/// Going to `panic` also flags the unit's active incident and appends a
/// panic note to it.
pub async fn change_status(
    storage: &Storage,
    session: &Session,
    status: UnitStatus,
    now: DateTime<Utc>,
) -> Result<Unit> {
    session.require(Capability::ChangeOwnStatus)?;
    let unit = session.unit_number()?;

    set_unit_status(storage, unit, status, now).await?;
    log_shift_activity(
        storage,
        unit,
        ShiftLogKind::Status,
        &format!("Status changed to {status}"),
        now,
    )
    .await?;

    if status == UnitStatus::Panic {
        warn!(unit = %unit, "Panic activated");
        if let Some(incident) = active_incident(storage, unit).await? {
            let note = Note::new(PANIC_NOTE, session.note_author(), NoteType::Panic, now);
            append_note(storage, &incident.id, &note, json!({ "panicStatus": true }), now).await?;
        }
    } else {
        info!(unit = %unit, status = %status, "Unit status changed");
    }

    storage.require(UNITS, unit).await
}

/// A unit requests backup on its active incident. Returns the incident id.
pub async fn request_backup(
    storage: &Storage,
    session: &Session,
    now: DateTime<Utc>,
) -> Result<String> {
    session.require(Capability::RequestBackup)?;
    let unit = session.unit_number()?;

    let Some(incident) = active_incident(storage, unit).await? else {
        return Err(Error::Conflict(format!(
            "unit {unit} has no active incident"
        )));
    };

    let note = Note::new(BACKUP_NOTE, session.note_author(), NoteType::Backup, now);
    append_note(
        storage,
        &incident.id,
        &note,
        json!({ "backupRequested": true }),
        now,
    )
    .await?;
    log_shift_activity(storage, unit, ShiftLogKind::Incident, "Backup requested", now).await?;

    warn!(unit = %unit, incident = %incident.id, "Backup requested");
    Ok(incident.id)
}

/// A unit goes on break.
pub async fn start_break(storage: &Storage, session: &Session, now: DateTime<Utc>) -> Result<()> {
    session.require(Capability::ChangeOwnStatus)?;
    let unit = session.unit_number()?;

    set_unit_status(storage, unit, UnitStatus::OutOfService, now).await?;
    log_shift_activity(storage, unit, ShiftLogKind::Break, "Break started", now).await?;

    info!(unit = %unit, "Break started");
    Ok(())
}

/// A unit reports its position.
pub async fn report_location(
    storage: &Storage,
    session: &Session,
    location: GeoPoint,
    now: DateTime<Utc>,
) -> Result<()> {
    let unit = session.unit_number()?;
    if !(-90.0..=90.0).contains(&location.lat) || !(-180.0..=180.0).contains(&location.lng) {
        return Err(Error::invalid(format!(
            "location out of range: {}, {}",
            location.lat, location.lng
        )));
    }

    storage
        .update(
            UNITS,
            unit,
            fields(json!({ "location": location, "lastUpdated": now }))?,
        )
        .await
}

/// A supervisor overrides a unit's status.
pub async fn force_status(
    storage: &Storage,
    session: &Session,
    unit: &str,
    request: ForceStatusRequest,
    now: DateTime<Utc>,
) -> Result<Unit> {
    session.require(Capability::ForceUnitStatus)?;

    let reason = request
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .unwrap_or(DEFAULT_OVERRIDE_REASON);

    storage
        .update(
            UNITS,
            unit,
            fields(json!({
                "status": request.status,
                "lastUpdated": now,
                "lastStatusUpdate": {
                    "by": "supervisor",
                    "timestamp": now,
                    "reason": reason,
                },
            }))?,
        )
        .await?;

    warn!(unit = %unit, status = %request.status, reason, "Status forced by supervisor");
    storage.require(UNITS, unit).await
}

/// Dispatch removes a unit from the shift.
pub async fn kick_unit(
    storage: &Storage,
    session: &Session,
    unit: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    session.require(Capability::KickUnit)?;

    storage
        .update(
            UNITS,
            unit,
            fields(json!({
                "status": UnitStatus::Offline,
                "lastUpdated": now,
                "kickedBy": "dispatch",
                "kickedAt": now,
            }))?,
        )
        .await?;

    warn!(unit = %unit, "Unit kicked by dispatch");
    Ok(())
}

// ============================================================================
// BOLOs
// ============================================================================

pub async fn create_bolo(
    storage: &Storage,
    session: &Session,
    request: NewBoloRequest,
    now: DateTime<Utc>,
) -> Result<Bolo> {
    session.require(Capability::ManageBolos)?;
    let title = require_text(&request.title, "title")?;

    let mut bolo = Bolo {
        id: String::new(),
        bolo_type: request.bolo_type,
        status: BoloStatus::Active,
        title,
        description: request.description.trim().to_string(),
        priority: request.priority,
        created_at: Some(now),
        updated_at: Some(now),
        expires_at: request.expires_at,
        created_by: session.note_author(),
        location: request
            .location
            .map(|location| location.trim().to_string())
            .filter(|location| !location.is_empty()),
        notes: Vec::new(),
    };
    bolo.id = storage.insert(BOLOS, to_fields(&bolo)?).await?;

    info!(bolo = %bolo.id, by = %bolo.created_by, "BOLO issued");
    Ok(bolo)
}

/// Resolve an active BOLO. Expired and resolved BOLOs are left alone.
pub async fn resolve_bolo(
    storage: &Storage,
    session: &Session,
    bolo_id: &str,
    now: DateTime<Utc>,
) -> Result<Bolo> {
    session.require(Capability::ManageBolos)?;

    let bolo: Bolo = storage.require(BOLOS, bolo_id).await?;
    match bolo.effective_status(now) {
        BoloStatus::Active => {}
        other => {
            return Err(Error::Conflict(format!(
                "BOLO {bolo_id} is {}",
                other.as_str()
            )));
        }
    }

    storage
        .update(
            BOLOS,
            bolo_id,
            fields(json!({ "status": BoloStatus::Resolved, "updatedAt": now }))?,
        )
        .await?;

    info!(bolo = %bolo_id, "BOLO resolved");
    storage.require(BOLOS, bolo_id).await
}

// ============================================================================
// Radio
// ============================================================================

/// Channels a session hears. Dispatch and supervisors hear everything; a
/// unit hears dispatch plus the channels it has joined.
pub async fn tuned_channels(storage: &Storage, session: &Session) -> Result<Vec<RadioChannel>> {
    if session.role.allows(Capability::ListenAllChannels) {
        return Ok(RadioChannel::ALL.to_vec());
    }

    let unit = session.unit_number()?;
    let mut channels = vec![RadioChannel::Dispatch];
    if let Some(doc) = storage.get::<Unit>(UNITS, unit).await? {
        for channel in doc.active_channels {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
    }
    Ok(channels)
}

async fn ensure_tuned(storage: &Storage, session: &Session, channel: RadioChannel) -> Result<()> {
    if tuned_channels(storage, session).await?.contains(&channel) {
        Ok(())
    } else {
        Err(Error::Forbidden {
            role: session.role.as_str().to_string(),
            action: format!("use channel {} without joining it", channel.as_str()),
        })
    }
}

/// Messages on a channel, newest first.
pub async fn channel_messages(
    storage: &Storage,
    session: &Session,
    channel: RadioChannel,
) -> Result<Vec<RadioMessage>> {
    ensure_tuned(storage, session, channel).await?;

    let mut messages: Vec<RadioMessage> = storage
        .list::<RadioMessage>(RADIO_MESSAGES)
        .await?
        .into_iter()
        .filter(|message| message.channel_id == channel)
        .collect();
    sort_newest_first(&mut messages);
    Ok(messages)
}

pub async fn send_radio_message(
    storage: &Storage,
    session: &Session,
    channel: RadioChannel,
    request: RadioMessageRequest,
    now: DateTime<Utc>,
) -> Result<RadioMessage> {
    session.require(Capability::SendRadio)?;
    let text = require_text(&request.message, "message")?;
    ensure_tuned(storage, session, channel).await?;

    let mut message = RadioMessage {
        id: String::new(),
        channel_id: channel,
        unit_number: session.radio_label(),
        message: text,
        timestamp: Some(now),
    };
    message.id = storage.insert(RADIO_MESSAGES, to_fields(&message)?).await?;

    info!(channel = channel.as_str(), from = %message.unit_number, "Radio message sent");
    Ok(message)
}

/// Delete a radio message. Returns whether it existed.
pub async fn delete_radio_message(
    storage: &Storage,
    session: &Session,
    message_id: &str,
) -> Result<bool> {
    session.require(Capability::DeleteRadioMessage)?;

    let existed = storage.delete(RADIO_MESSAGES, message_id).await?;
    info!(message = %message_id, existed, "Radio message deleted");
    Ok(existed)
}

/// Join or leave a radio channel. The dispatch channel cannot be left.
/// Returns the unit's channels afterwards.
pub async fn toggle_channel(
    storage: &Storage,
    session: &Session,
    channel: RadioChannel,
    now: DateTime<Utc>,
) -> Result<Vec<RadioChannel>> {
    session.require(Capability::ToggleRadioChannels)?;
    let unit = session.unit_number()?;
    if channel == RadioChannel::Dispatch {
        return Err(Error::invalid("the dispatch channel is always monitored"));
    }

    let doc: Unit = storage.require(UNITS, unit).await?;
    let mut channels = doc.active_channels;
    if let Some(position) = channels.iter().position(|joined| *joined == channel) {
        channels.remove(position);
    } else {
        channels.push(channel);
    }

    storage
        .update(
            UNITS,
            unit,
            fields(json!({ "activeChannels": channels, "lastUpdated": now }))?,
        )
        .await?;

    info!(unit = %unit, channel = channel.as_str(), "Radio channels changed");
    Ok(channels)
}

// ============================================================================
// Shift log
// ============================================================================

/// Start of the UTC day containing `now`.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0);
    match midnight {
        Some(midnight) => midnight.and_utc(),
        None => now - Duration::hours(24),
    }
}

/// Today's shift log for the calling unit, newest first.
pub async fn shift_log(
    storage: &Storage,
    session: &Session,
    now: DateTime<Utc>,
) -> Result<Vec<ShiftLogEntry>> {
    let unit = session.unit_number()?;
    let since = start_of_day(now);

    let mut entries: Vec<ShiftLogEntry> = storage
        .list::<ShiftLogEntry>(SHIFT_LOGS)
        .await?
        .into_iter()
        .filter(|entry| entry.unit_number == unit)
        .filter(|entry| entry.timestamp.is_some_and(|ts| ts >= since))
        .collect();
    sort_newest_first(&mut entries);
    Ok(entries)
}

pub async fn add_shift_note(
    storage: &Storage,
    session: &Session,
    request: ShiftNoteRequest,
    now: DateTime<Utc>,
) -> Result<ShiftLogEntry> {
    session.require(Capability::WriteShiftLog)?;
    let unit = session.unit_number()?;
    let description = require_text(&request.description, "description")?;

    log_shift_activity(storage, unit, ShiftLogKind::Note, &description, now).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::model::Priority;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap()
    }

    fn session(identity: &str, role: Role) -> Session {
        Session {
            token: format!("token-{identity}"),
            identity: identity.to_string(),
            role,
            started_at: now(),
        }
    }

    async fn setup() -> (Storage, Session, Session) {
        let storage = Storage::new("sqlite::memory:", "T1S1").await.unwrap();
        let dispatch = session("Alex", Role::Dispatch);
        let unit = session("12", Role::Unit);
        start_shift(&storage, &unit, now()).await.unwrap();
        (storage, dispatch, unit)
    }

    fn call(incident_type: &str) -> NewIncidentRequest {
        NewIncidentRequest {
            incident_type: incident_type.to_string(),
            location: "Main St & 3rd".to_string(),
            description: String::new(),
            priority: Priority::High,
        }
    }

    #[tokio::test]
    async fn test_start_shift_creates_unit() {
        let (storage, _, unit) = setup().await;

        let doc: Unit = storage.require(UNITS, "12").await.unwrap();
        assert_eq!(doc.status, UnitStatus::Available);
        assert_eq!(doc.unit_type, "patrol");
        assert_eq!(doc.active_channels, vec![RadioChannel::Dispatch]);

        let log = shift_log(&storage, &unit, now()).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].description, "Unit initialized and started shift");
    }

    #[tokio::test]
    async fn test_dispatch_call_starts_pending() {
        let (storage, dispatch, _) = setup().await;

        let incident = create_incident(&storage, &dispatch, call("Burglary"), now())
            .await
            .unwrap();

        assert_eq!(incident.status, IncidentStatus::Pending);
        assert_eq!(incident.responding_code, RespondingCode::CODE_2);
        assert!(incident.assigned_units.is_empty());
        assert_eq!(incident.dispatcher_id, "dispatch");
    }

    #[tokio::test]
    async fn test_unit_call_is_self_dispatched() {
        let (storage, _, unit) = setup().await;

        let incident = create_incident(&storage, &unit, call("Traffic Stop"), now())
            .await
            .unwrap();

        assert_eq!(incident.status, IncidentStatus::Dispatched);
        assert_eq!(incident.assigned_units, vec!["12".to_string()]);
        let doc: Unit = storage.require(UNITS, "12").await.unwrap();
        assert_eq!(doc.status, UnitStatus::Busy);
    }

    #[tokio::test]
    async fn test_blank_call_rejected() {
        let (storage, dispatch, _) = setup().await;

        let err = create_incident(&storage, &dispatch, call("   "), now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_assign_moves_incident_and_unit() {
        let (storage, dispatch, _) = setup().await;
        let incident = create_incident(&storage, &dispatch, call("Fight"), now())
            .await
            .unwrap();

        let assigned = assign_unit(&storage, &dispatch, &incident.id, "12", now())
            .await
            .unwrap();

        assert_eq!(assigned.status, IncidentStatus::Dispatched);
        assert!(assigned.is_assigned_to("12"));
        let doc: Unit = storage.require(UNITS, "12").await.unwrap();
        assert_eq!(doc.status, UnitStatus::Busy);

        // Assigning the same unit again is a no-op.
        let again = assign_unit(&storage, &dispatch, &incident.id, "12", now())
            .await
            .unwrap();
        assert_eq!(again.assigned_units, vec!["12".to_string()]);
    }

    #[tokio::test]
    async fn test_single_assignment_enforced() {
        let (storage, dispatch, _) = setup().await;
        let first = create_incident(&storage, &dispatch, call("Fight"), now())
            .await
            .unwrap();
        let second = create_incident(&storage, &dispatch, call("Theft"), now())
            .await
            .unwrap();

        assign_unit(&storage, &dispatch, &first.id, "12", now())
            .await
            .unwrap();
        let err = assign_unit(&storage, &dispatch, &second.id, "12", now())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict(_)));
        let untouched: Incident = storage.require(INCIDENTS, &second.id).await.unwrap();
        assert_eq!(untouched.status, IncidentStatus::Pending);
    }

    #[tokio::test]
    async fn test_unit_role_cannot_assign() {
        let (storage, dispatch, unit) = setup().await;
        let incident = create_incident(&storage, &dispatch, call("Fight"), now())
            .await
            .unwrap();

        let err = assign_unit(&storage, &unit, &incident.id, "12", now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));
    }

    #[tokio::test]
    async fn test_complete_call_resolves_and_frees_unit() {
        let (storage, _, unit) = setup().await;
        let incident = create_incident(&storage, &unit, call("Traffic Stop"), now())
            .await
            .unwrap();

        let resolved = complete_call(&storage, &unit, &incident.id, now())
            .await
            .unwrap();

        assert_eq!(resolved.status, IncidentStatus::Resolved);
        let doc: Unit = storage.require(UNITS, "12").await.unwrap();
        assert_eq!(doc.status, UnitStatus::Available);

        let log = shift_log(&storage, &unit, now()).await.unwrap();
        assert!(
            log.iter()
                .any(|entry| entry.description == "Completed call: Traffic Stop")
        );

        let err = complete_call(&storage, &unit, &incident.id, now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_pending_call_cannot_be_closed() {
        let (storage, dispatch, _) = setup().await;
        let incident = create_incident(&storage, &dispatch, call("Noise"), now())
            .await
            .unwrap();

        let err = close_incident(&storage, &dispatch, &incident.id, now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: IncidentStatus::Pending,
                to: IncidentStatus::Resolved,
            }
        ));
    }

    #[tokio::test]
    async fn test_close_returns_units_to_service() {
        let (storage, dispatch, _) = setup().await;
        let incident = create_incident(&storage, &dispatch, call("Noise"), now())
            .await
            .unwrap();
        assign_unit(&storage, &dispatch, &incident.id, "12", now())
            .await
            .unwrap();

        close_incident(&storage, &dispatch, &incident.id, now())
            .await
            .unwrap();

        let doc: Unit = storage.require(UNITS, "12").await.unwrap();
        assert_eq!(doc.status, UnitStatus::Available);
        assert!(active_incident(&storage, "12").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_assignments_book_unit_once() {
        let path = std::env::temp_dir().join(format!(
            "cad-assign-{}.db",
            uuid::Uuid::new_v4().simple()
        ));
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let storage = Storage::new(&url, "T1S1").await.unwrap();
        let dispatch = session("Alex", Role::Dispatch);
        let unit = session("12", Role::Unit);
        start_shift(&storage, &unit, now()).await.unwrap();

        for _ in 0..20 {
            let a = create_incident(&storage, &dispatch, call("Fight"), now())
                .await
                .unwrap();
            let b = create_incident(&storage, &dispatch, call("Theft"), now())
                .await
                .unwrap();

            let (first, second) = tokio::join!(
                assign_unit(&storage, &dispatch, &a.id, "12", now()),
                assign_unit(&storage, &dispatch, &b.id, "12", now()),
            );

            let refused = match (first, second) {
                (Ok(_), Err(err)) | (Err(err), Ok(_)) => err,
                (Ok(_), Ok(_)) => panic!("unit 12 booked on two calls"),
                (Err(a), Err(b)) => panic!("both assignments failed: {a}, {b}"),
            };
            assert!(matches!(refused, Error::Conflict(_)));

            let incidents = storage.list::<Incident>(INCIDENTS).await.unwrap();
            let working = incidents_for_unit("12", &incidents);
            assert_eq!(working.len(), 1);
            let working_id = working[0].id.clone();

            close_incident(&storage, &dispatch, &working_id, now())
                .await
                .unwrap();
        }

        drop(storage);
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }

    #[tokio::test]
    async fn test_delete_removes_call_in_any_status() {
        let (storage, dispatch, unit) = setup().await;
        let pending = create_incident(&storage, &dispatch, call("Prank"), now())
            .await
            .unwrap();
        let dispatched = create_incident(&storage, &dispatch, call("Duplicate"), now())
            .await
            .unwrap();
        assign_unit(&storage, &dispatch, &dispatched.id, "12", now())
            .await
            .unwrap();

        let err = delete_incident(&storage, &unit, &pending.id, now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));

        delete_incident(&storage, &dispatch, &pending.id, now())
            .await
            .unwrap();
        delete_incident(&storage, &dispatch, &dispatched.id, now())
            .await
            .unwrap();

        assert!(storage.get::<Incident>(INCIDENTS, &pending.id).await.unwrap().is_none());
        assert!(storage.get::<Incident>(INCIDENTS, &dispatched.id).await.unwrap().is_none());
        let doc: Unit = storage.require(UNITS, "12").await.unwrap();
        assert_eq!(doc.status, UnitStatus::Available);

        let err = delete_incident(&storage, &dispatch, &pending.id, now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_resolved_call_is_read_only() {
        let (storage, dispatch, unit) = setup().await;
        let incident = create_incident(&storage, &unit, call("Traffic Stop"), now())
            .await
            .unwrap();
        complete_call(&storage, &unit, &incident.id, now())
            .await
            .unwrap();

        let err = toggle_code_red(&storage, &dispatch, &incident.id, now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = set_responding_code(
            &storage,
            &dispatch,
            &incident.id,
            RespondingCode::CODE_3,
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = edit_incident(
            &storage,
            &dispatch,
            &incident.id,
            EditIncidentRequest {
                location: Some("Elsewhere".to_string()),
                ..EditIncidentRequest::default()
            },
            now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let doc: Incident = storage.require(INCIDENTS, &incident.id).await.unwrap();
        assert!(!doc.code_red);
        assert_eq!(doc.responding_code, RespondingCode::CODE_2);
        assert_eq!(doc.location, "Main St & 3rd");
    }

    #[tokio::test]
    async fn test_panic_flags_active_incident() {
        let (storage, _, unit) = setup().await;
        let incident = create_incident(&storage, &unit, call("Traffic Stop"), now())
            .await
            .unwrap();

        change_status(&storage, &unit, UnitStatus::Panic, now())
            .await
            .unwrap();

        let flagged: Incident = storage.require(INCIDENTS, &incident.id).await.unwrap();
        assert!(flagged.panic_status);
        assert_eq!(flagged.notes.len(), 1);
        assert_eq!(flagged.notes[0].note_type, NoteType::Panic);
        assert_eq!(flagged.notes[0].author, "Unit 12");
    }

    #[tokio::test]
    async fn test_panic_without_incident_only_sets_status() {
        let (storage, _, unit) = setup().await;

        let doc = change_status(&storage, &unit, UnitStatus::Panic, now())
            .await
            .unwrap();
        assert_eq!(doc.status, UnitStatus::Panic);
    }

    #[tokio::test]
    async fn test_backup_requires_active_incident() {
        let (storage, _, unit) = setup().await;

        let err = request_backup(&storage, &unit, now()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let incident = create_incident(&storage, &unit, call("Pursuit"), now())
            .await
            .unwrap();
        let id = request_backup(&storage, &unit, now()).await.unwrap();
        assert_eq!(id, incident.id);

        let flagged: Incident = storage.require(INCIDENTS, &incident.id).await.unwrap();
        assert!(flagged.backup_requested);
        assert_eq!(flagged.notes[0].note_type, NoteType::Backup);
    }

    #[tokio::test]
    async fn test_supervisor_note_defaults() {
        let (storage, dispatch, _) = setup().await;
        let supervisor = session("Sgt Lee", Role::Supervisor);
        let incident = create_incident(&storage, &dispatch, call("Fight"), now())
            .await
            .unwrap();

        let note = add_note(
            &storage,
            &supervisor,
            &incident.id,
            NoteRequest {
                text: "Hold perimeter".to_string(),
                note_type: None,
            },
            now(),
        )
        .await
        .unwrap();

        assert_eq!(note.author, "Supervisor");
        assert_eq!(note.note_type, NoteType::Supervisor);
    }

    #[tokio::test]
    async fn test_force_status_records_override() {
        let (storage, _, _) = setup().await;
        let supervisor = session("Sgt Lee", Role::Supervisor);

        let doc = force_status(
            &storage,
            &supervisor,
            "12",
            ForceStatusRequest {
                status: UnitStatus::OutOfService,
                reason: None,
            },
            now(),
        )
        .await
        .unwrap();

        assert_eq!(doc.status, UnitStatus::OutOfService);
        let record = doc.last_status_update.unwrap();
        assert_eq!(record.by, "supervisor");
        assert_eq!(record.reason, "Supervisor override");
    }

    #[tokio::test]
    async fn test_kick_then_rejoin_clears_kick() {
        let (storage, dispatch, unit) = setup().await;

        kick_unit(&storage, &dispatch, "12", now()).await.unwrap();
        let kicked: Unit = storage.require(UNITS, "12").await.unwrap();
        assert_eq!(kicked.status, UnitStatus::Offline);
        assert_eq!(kicked.kicked_by.as_deref(), Some("dispatch"));

        start_shift(&storage, &unit, now()).await.unwrap();
        let back: Unit = storage.require(UNITS, "12").await.unwrap();
        assert!(back.kicked_by.is_none());
    }

    #[tokio::test]
    async fn test_radio_channel_membership() {
        let (storage, dispatch, unit) = setup().await;
        let message = |text: &str| RadioMessageRequest {
            message: text.to_string(),
        };

        let err = send_radio_message(&storage, &unit, RadioChannel::Tac1, message("10-4"), now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden { .. }));

        let channels = toggle_channel(&storage, &unit, RadioChannel::Tac1, now())
            .await
            .unwrap();
        assert!(channels.contains(&RadioChannel::Tac1));

        send_radio_message(&storage, &unit, RadioChannel::Tac1, message("10-4"), now())
            .await
            .unwrap();
        let sent = send_radio_message(
            &storage,
            &dispatch,
            RadioChannel::Tac1,
            message("Copy"),
            now() + Duration::seconds(5),
        )
        .await
        .unwrap();
        assert_eq!(sent.unit_number, "Dispatch");

        let log = channel_messages(&storage, &unit, RadioChannel::Tac1)
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "Copy");

        let err = send_radio_message(&storage, &dispatch, RadioChannel::Fire, message("  "), now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_only_dispatch_and_supervisor_delete_radio() {
        let (storage, dispatch, unit) = setup().await;
        let sent = send_radio_message(
            &storage,
            &unit,
            RadioChannel::Dispatch,
            RadioMessageRequest {
                message: "On scene".to_string(),
            },
            now(),
        )
        .await
        .unwrap();

        assert!(delete_radio_message(&storage, &unit, &sent.id).await.is_err());
        assert!(delete_radio_message(&storage, &dispatch, &sent.id).await.unwrap());
        assert!(!delete_radio_message(&storage, &dispatch, &sent.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_expired_bolo_refused() {
        let (storage, dispatch, _) = setup().await;
        let bolo = create_bolo(
            &storage,
            &dispatch,
            NewBoloRequest {
                bolo_type: crate::model::BoloType::Vehicle,
                title: "Red pickup".to_string(),
                description: String::new(),
                priority: Priority::High,
                expires_at: Some(now() - Duration::minutes(5)),
                location: None,
            },
            now(),
        )
        .await
        .unwrap();

        let err = resolve_bolo(&storage, &dispatch, &bolo.id, now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let stored: Bolo = storage.require(BOLOS, &bolo.id).await.unwrap();
        assert_eq!(stored.status, BoloStatus::Active);
    }

    #[tokio::test]
    async fn test_shift_log_only_today() {
        let (storage, _, unit) = setup().await;

        log_shift_activity(
            &storage,
            "12",
            ShiftLogKind::Note,
            "yesterday",
            now() - Duration::days(1),
        )
        .await
        .unwrap();
        add_shift_note(
            &storage,
            &unit,
            ShiftNoteRequest {
                description: "Fuel stop".to_string(),
            },
            now() + Duration::minutes(1),
        )
        .await
        .unwrap();

        let log = shift_log(&storage, &unit, now() + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].description, "Fuel stop");
        assert!(log.iter().all(|entry| entry.description != "yesterday"));
    }
}
