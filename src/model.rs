//! Data models for the CAD console.
//!
//! Every entity here is a document owned by the store. The console never
//! keeps its own copy: it reads snapshots, derives views from them and
//! writes field updates back.
//!
//! Documents are stored with camelCase field names, the same shape the
//! browser console used, so a snapshot can be handed to a front end as-is.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Incident priority. `High` ranks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Lifecycle of an incident.
///
/// The only transitions are `pending -> dispatched` (a unit is assigned) and
/// `dispatched -> resolved` (the call is completed or closed). Assigning a
/// further unit keeps an incident `dispatched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Pending,
    Dispatched,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Pending => "pending",
            IncidentStatus::Dispatched => "dispatched",
            IncidentStatus::Resolved => "resolved",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        matches!(
            (self, next),
            (IncidentStatus::Pending, IncidentStatus::Dispatched)
                | (IncidentStatus::Dispatched, IncidentStatus::Dispatched)
                | (IncidentStatus::Dispatched, IncidentStatus::Resolved)
        )
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a unit reports (or has forced on it by a supervisor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    Busy,
    OutOfService,
    Panic,
    Offline,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::Busy => "busy",
            UnitStatus::OutOfService => "out_of_service",
            UnitStatus::Panic => "panic",
            UnitStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of note attached to an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteType {
    #[default]
    Info,
    Warning,
    Update,
    Panic,
    Backup,
    Evidence,
    Medical,
    Fire,
    Supervisor,
}

/// Radio response code. Code 1 is a normal response, code 2 urgent without
/// lights and sirens, code 3 an emergency response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct RespondingCode(u8);

impl RespondingCode {
    pub const CODE_1: RespondingCode = RespondingCode(1);
    pub const CODE_2: RespondingCode = RespondingCode(2);
    pub const CODE_3: RespondingCode = RespondingCode(3);

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for RespondingCode {
    fn default() -> Self {
        RespondingCode::CODE_2
    }
}

impl TryFrom<u8> for RespondingCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1..=3 => Ok(RespondingCode(value)),
            other => Err(format!("responding code must be 1, 2 or 3, got {other}")),
        }
    }
}

impl From<RespondingCode> for u8 {
    fn from(code: RespondingCode) -> Self {
        code.0
    }
}

/// An append-only note on an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Generated from the creation time in milliseconds.
    pub id: String,
    pub text: String,
    pub author: String,
    #[serde(rename = "type", default)]
    pub note_type: NoteType,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Note {
    pub fn new(
        text: impl Into<String>,
        author: impl Into<String>,
        note_type: NoteType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: now.timestamp_millis().to_string(),
            text: text.into(),
            author: author.into(),
            note_type,
            timestamp: Some(now),
        }
    }
}

/// A call for service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    /// Store-assigned document key.
    #[serde(default)]
    pub id: String,

    /// Call type, e.g. "Traffic Stop" or "Medical Emergency".
    #[serde(rename = "type")]
    pub incident_type: String,

    pub location: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub priority: Priority,

    pub status: IncidentStatus,

    /// When the call was created. Missing timestamps sort as the epoch.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Unit numbers working the call. Appended with union semantics.
    #[serde(default)]
    pub assigned_units: Vec<String>,

    /// Who opened the call: a unit number, "dispatch" or "supervisor".
    #[serde(default)]
    pub dispatcher_id: String,

    #[serde(default)]
    pub notes: Vec<Note>,

    #[serde(default)]
    pub code_red: bool,

    #[serde(default)]
    pub responding_code: RespondingCode,

    #[serde(default)]
    pub backup_requested: bool,

    #[serde(default)]
    pub panic_status: bool,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn is_assigned_to(&self, unit: &str) -> bool {
        self.assigned_units.iter().any(|assigned| assigned == unit)
    }
}

/// A geographic fix reported by a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Audit record written when a supervisor overrides a unit's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusOverride {
    pub by: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// A field unit. The document key is the unit number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    #[serde(default)]
    pub id: String,

    pub unit_number: String,

    #[serde(rename = "type", default = "default_unit_type")]
    pub unit_type: String,

    pub status: UnitStatus,

    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(default)]
    pub location: Option<GeoPoint>,

    /// Set to "dispatch" when the unit was removed from the shift by a dispatcher.
    #[serde(default)]
    pub kicked_by: Option<String>,

    #[serde(default)]
    pub kicked_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_status_update: Option<StatusOverride>,

    /// Radio channels the unit has joined besides dispatch.
    #[serde(default)]
    pub active_channels: Vec<RadioChannel>,
}

fn default_unit_type() -> String {
    "patrol".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoloType {
    Person,
    Vehicle,
    Property,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoloStatus {
    Active,
    Resolved,
    Expired,
}

impl BoloStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoloStatus::Active => "active",
            BoloStatus::Resolved => "resolved",
            BoloStatus::Expired => "expired",
        }
    }
}

/// A "be on the lookout" alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bolo {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub bolo_type: BoloType,

    pub status: BoloStatus,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// After this instant an active BOLO reads as expired.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub created_by: String,

    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub notes: Vec<Note>,
}

impl Bolo {
    /// Status as seen at `now`.
    ///
    /// Expiry is evaluated at read time: the stored status of an active BOLO
    /// is never rewritten to `expired`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> BoloStatus {
        match (self.status, self.expires_at) {
            (BoloStatus::Active, Some(expires_at)) if expires_at <= now => BoloStatus::Expired,
            (status, _) => status,
        }
    }
}

/// Radio channels available on every server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioChannel {
    Dispatch,
    Tac1,
    Tac2,
    Fire,
    Ems,
}

impl RadioChannel {
    pub const ALL: [RadioChannel; 5] = [
        RadioChannel::Dispatch,
        RadioChannel::Tac1,
        RadioChannel::Tac2,
        RadioChannel::Fire,
        RadioChannel::Ems,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RadioChannel::Dispatch => "dispatch",
            RadioChannel::Tac1 => "tac1",
            RadioChannel::Tac2 => "tac2",
            RadioChannel::Fire => "fire",
            RadioChannel::Ems => "ems",
        }
    }
}

impl FromStr for RadioChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RadioChannel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == s)
            .ok_or_else(|| Error::invalid(format!("unknown radio channel '{s}'")))
    }
}

/// A message sent on a radio channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RadioMessage {
    #[serde(default)]
    pub id: String,
    pub channel_id: RadioChannel,
    /// Sender label: a unit number, "Dispatch" or "Supervisor".
    pub unit_number: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftLogKind {
    Status,
    Incident,
    Break,
    Note,
}

/// One line of a unit's shift log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftLogEntry {
    #[serde(default)]
    pub id: String,
    pub unit_number: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub kind: ShiftLogKind,
    pub description: String,
}

/// The three shift patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftKind {
    Day,
    Night,
    Swing,
}

impl ShiftKind {
    /// Shift in effect at `now`: night from 18:00, day from 10:00, swing before that.
    pub fn at(now: DateTime<Utc>) -> Self {
        match now.hour() {
            h if h >= 18 => ShiftKind::Night,
            h if h >= 10 => ShiftKind::Day,
            _ => ShiftKind::Swing,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ShiftKind::Day => "Day Shift (0600-1800)",
            ShiftKind::Night => "Night Shift (1800-0600)",
            ShiftKind::Swing => "Swing Shift (1000-2200)",
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

/// Request body for POST /incidents.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIncidentRequest {
    #[serde(rename = "type")]
    pub incident_type: String,
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Request body for PATCH /incidents/:id. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditIncidentRequest {
    #[serde(rename = "type")]
    pub incident_type: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
}

/// Request body for POST /incidents/:id/assign.
#[derive(Debug, Clone, Deserialize)]
pub struct AssignUnitRequest {
    pub unit: String,
}

/// Request body for POST /incidents/:id/notes.
#[derive(Debug, Clone, Deserialize)]
pub struct NoteRequest {
    pub text: String,
    #[serde(rename = "type")]
    pub note_type: Option<NoteType>,
}

/// Request body for POST /incidents/:id/responding-code.
#[derive(Debug, Clone, Deserialize)]
pub struct RespondingCodeRequest {
    pub code: RespondingCode,
}

/// Request body for POST /units/me/status.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub status: UnitStatus,
}

/// Request body for POST /units/:id/force-status.
#[derive(Debug, Clone, Deserialize)]
pub struct ForceStatusRequest {
    pub status: UnitStatus,
    pub reason: Option<String>,
}

/// Request body for POST /bolos.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBoloRequest {
    #[serde(rename = "type")]
    pub bolo_type: BoloType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    pub expires_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
}

/// Request body for POST /radio/:channel.
#[derive(Debug, Clone, Deserialize)]
pub struct RadioMessageRequest {
    pub message: String,
}

/// Request body for POST /shift-log.
#[derive(Debug, Clone, Deserialize)]
pub struct ShiftNoteRequest {
    pub description: String,
}
