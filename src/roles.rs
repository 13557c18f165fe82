//! Roles, capabilities and sessions.
//!
//! A session's role is fixed at login and travels with the session value into
//! every operation and view; nothing reads a global role flag. The capability
//! table is static and is checked here, on the server, before any write.
//! Supervisor sessions require the credential configured for the service.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::NoteType;

/// Who is at the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Dispatch,
    Unit,
    Supervisor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Dispatch => "dispatch",
            Role::Unit => "unit",
            Role::Supervisor => "supervisor",
        }
    }

    /// The dashboard this role sees.
    pub fn dashboard(&self) -> DashboardKind {
        match self {
            Role::Dispatch => DashboardKind::Dispatch,
            Role::Unit => DashboardKind::Unit,
            Role::Supervisor => DashboardKind::Supervisor,
        }
    }

    /// Actions exposed to this role.
    pub fn capabilities(&self) -> &'static [Capability] {
        use Capability::*;

        match self {
            Role::Dispatch => &[
                CreateIncident,
                EditIncident,
                AssignUnit,
                CloseIncident,
                AddNote,
                ToggleCodeRed,
                SetRespondingCode,
                KickUnit,
                SendRadio,
                DeleteRadioMessage,
                ListenAllChannels,
                ManageBolos,
            ],
            Role::Supervisor => &[
                CreateIncident,
                EditIncident,
                AssignUnit,
                CloseIncident,
                AddNote,
                ToggleCodeRed,
                SetRespondingCode,
                ForceUnitStatus,
                SendRadio,
                DeleteRadioMessage,
                ListenAllChannels,
                ManageBolos,
                ViewAnalytics,
            ],
            Role::Unit => &[
                CreateIncident,
                AddNote,
                ChangeOwnStatus,
                CompleteCall,
                RequestBackup,
                SendRadio,
                ToggleRadioChannels,
                WriteShiftLog,
                ManageBolos,
            ],
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Dashboard compositions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DashboardKind {
    Dispatch,
    Unit,
    Supervisor,
}

/// Actions a role may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CreateIncident,
    EditIncident,
    AssignUnit,
    CloseIncident,
    AddNote,
    ToggleCodeRed,
    SetRespondingCode,
    ChangeOwnStatus,
    CompleteCall,
    RequestBackup,
    ForceUnitStatus,
    KickUnit,
    SendRadio,
    DeleteRadioMessage,
    ListenAllChannels,
    ToggleRadioChannels,
    WriteShiftLog,
    ManageBolos,
    ViewAnalytics,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CreateIncident => "create_incident",
            Capability::EditIncident => "edit_incident",
            Capability::AssignUnit => "assign_unit",
            Capability::CloseIncident => "close_incident",
            Capability::AddNote => "add_note",
            Capability::ToggleCodeRed => "toggle_code_red",
            Capability::SetRespondingCode => "set_responding_code",
            Capability::ChangeOwnStatus => "change_own_status",
            Capability::CompleteCall => "complete_call",
            Capability::RequestBackup => "request_backup",
            Capability::ForceUnitStatus => "force_unit_status",
            Capability::KickUnit => "kick_unit",
            Capability::SendRadio => "send_radio",
            Capability::DeleteRadioMessage => "delete_radio_message",
            Capability::ListenAllChannels => "listen_all_channels",
            Capability::ToggleRadioChannels => "toggle_radio_channels",
            Capability::WriteShiftLog => "write_shift_log",
            Capability::ManageBolos => "manage_bolos",
            Capability::ViewAnalytics => "view_analytics",
        }
    }
}

/// An authenticated console session. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub token: String,
    /// Unit number for unit sessions, the operator's name otherwise.
    pub identity: String,
    pub role: Role,
    pub started_at: DateTime<Utc>,
}

impl Session {
    /// Fail with `Forbidden` unless the role grants `capability`.
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.role.allows(capability) {
            Ok(())
        } else {
            Err(Error::Forbidden {
                role: self.role.as_str().to_string(),
                action: capability.as_str().to_string(),
            })
        }
    }

    /// The unit number of a unit session.
    pub fn unit_number(&self) -> Result<&str> {
        match self.role {
            Role::Unit => Ok(&self.identity),
            other => Err(Error::Forbidden {
                role: other.as_str().to_string(),
                action: "act as a unit".to_string(),
            }),
        }
    }

    /// Author line on notes.
    pub fn note_author(&self) -> String {
        match self.role {
            Role::Unit => format!("Unit {}", self.identity),
            Role::Dispatch => "Dispatch".to_string(),
            Role::Supervisor => "Supervisor".to_string(),
        }
    }

    /// Sender label on radio traffic.
    pub fn radio_label(&self) -> String {
        match self.role {
            Role::Unit => self.identity.clone(),
            Role::Dispatch => "Dispatch".to_string(),
            Role::Supervisor => "Supervisor".to_string(),
        }
    }

    /// Note type used when the caller does not pick one.
    pub fn default_note_type(&self) -> NoteType {
        match self.role {
            Role::Supervisor => NoteType::Supervisor,
            Role::Dispatch | Role::Unit => NoteType::Info,
        }
    }

    /// Value written to `dispatcherId` on calls this session opens.
    pub fn dispatcher_id(&self) -> String {
        match self.role {
            Role::Unit => self.identity.clone(),
            Role::Dispatch => "dispatch".to_string(),
            Role::Supervisor => "supervisor".to_string(),
        }
    }
}

/// Request body for POST /session.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    /// Unit number for units, operator name for dispatch and supervisors.
    pub identifier: String,
    pub role: Role,
    pub credential: Option<String>,
}

/// Issued sessions, keyed by token.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    supervisor_key: Option<String>,
}

impl SessionStore {
    pub fn new(supervisor_key: Option<String>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            supervisor_key,
        }
    }

    /// Check a login request and issue a session.
    pub async fn login(&self, request: &LoginRequest, now: DateTime<Utc>) -> Result<Session> {
        let identity = request.identifier.trim();
        if identity.is_empty() {
            return Err(Error::invalid("identifier is required"));
        }

        if request.role == Role::Supervisor {
            let Some(expected) = self.supervisor_key.as_deref() else {
                return Err(Error::Forbidden {
                    role: Role::Supervisor.as_str().to_string(),
                    action: "log in (no supervisor credential configured)".to_string(),
                });
            };
            if request.credential.as_deref() != Some(expected) {
                return Err(Error::Unauthorized);
            }
        }

        let session = Session {
            token: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            role: request.role,
            started_at: now,
        };
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());

        Ok(session)
    }

    /// Look up a session by token.
    pub async fn resolve(&self, token: &str) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(Error::Unauthorized)
    }

    /// Drop a session. Returns the removed session.
    pub async fn logout(&self, token: &str) -> Result<Session> {
        self.sessions
            .write()
            .await
            .remove(token)
            .ok_or(Error::Unauthorized)
    }

    /// Drop every session held by a unit number, e.g. after a kick.
    pub async fn revoke_unit(&self, unit: &str) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !(session.role == Role::Unit && session.identity == unit));
        before - sessions.len()
    }
}
