//! Derived view state shared by every dashboard.
//!
//! Everything here is a pure function of the latest snapshots: ranking unit
//! statuses, ordering records newest first, splitting incidents into display
//! buckets, finding a unit's active call and filtering BOLOs at read time.
//! Dashboards recompute these on every snapshot; nothing is cached.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{
    Bolo, BoloStatus, Incident, IncidentStatus, Priority, RadioMessage, ShiftLogEntry, Unit,
    UnitStatus,
};

/// Resolved calls shown on a dashboard summary.
pub const RECENT_RESOLVED_CAP: usize = 3;

/// Past calls the unit dashboard queries for.
pub const PAST_CALLS_LIMIT: usize = 5;

// ============================================================================
// Priority/status ranking
// ============================================================================

/// Display rank of a unit status; lower sorts first.
///
/// `panic < busy < available < out_of_service < offline`
pub fn unit_status_rank(status: UnitStatus) -> u8 {
    match status {
        UnitStatus::Panic => 0,
        UnitStatus::Busy => 1,
        UnitStatus::Available => 2,
        UnitStatus::OutOfService => 3,
        UnitStatus::Offline => 4,
    }
}

/// Display rank of a priority; `high` sorts first.
pub fn priority_rank(priority: Priority) -> u8 {
    match priority {
        Priority::High => 0,
        Priority::Medium => 1,
        Priority::Low => 2,
    }
}

fn newest_first(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    // None sorts as the epoch, i.e. after every real timestamp.
    b.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .cmp(&a.unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
}

/// Order units by status rank, most recently updated first within a rank.
pub fn sort_units(units: &mut [Unit]) {
    units.sort_by(|a, b| {
        unit_status_rank(a.status)
            .cmp(&unit_status_rank(b.status))
            .then_with(|| newest_first(a.last_updated, b.last_updated))
    });
}

// ============================================================================
// Chronological ordering
// ============================================================================

/// Records with a timestamp used for newest-first ordering.
pub trait Timestamped {
    fn sort_timestamp(&self) -> Option<DateTime<Utc>>;
}

impl Timestamped for Incident {
    /// Creation time, falling back to the last update for documents written
    /// without one.
    fn sort_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.or(self.updated_at)
    }
}

impl Timestamped for Bolo {
    fn sort_timestamp(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

impl Timestamped for RadioMessage {
    fn sort_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

impl Timestamped for ShiftLogEntry {
    fn sort_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

/// Stable sort, newest first. Missing timestamps sort last.
pub fn sort_newest_first<T: Timestamped>(records: &mut [T]) {
    records.sort_by(|a, b| newest_first(a.sort_timestamp(), b.sort_timestamp()));
}

/// Order BOLOs by priority rank, then newest first.
pub fn sort_bolos(bolos: &mut [Bolo]) {
    bolos.sort_by(|a, b| {
        priority_rank(a.priority)
            .cmp(&priority_rank(b.priority))
            .then_with(|| newest_first(a.sort_timestamp(), b.sort_timestamp()))
    });
}

// ============================================================================
// Incident classification
// ============================================================================

/// Incidents split by status, each bucket newest first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IncidentBuckets {
    pub pending: Vec<Incident>,
    pub active: Vec<Incident>,
    pub resolved: Vec<Incident>,
}

impl IncidentBuckets {
    /// The resolved calls a dashboard summary shows.
    pub fn recently_resolved(&self) -> &[Incident] {
        let end = self.resolved.len().min(RECENT_RESOLVED_CAP);
        &self.resolved[..end]
    }

    /// Incidents not yet resolved, newest first.
    pub fn open(&self) -> Vec<Incident> {
        let mut open: Vec<Incident> = self
            .pending
            .iter()
            .chain(self.active.iter())
            .cloned()
            .collect();
        sort_newest_first(&mut open);
        open
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.active.len() + self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sort incidents newest first and partition them by status.
pub fn classify_incidents(mut incidents: Vec<Incident>) -> IncidentBuckets {
    sort_newest_first(&mut incidents);

    let mut buckets = IncidentBuckets::default();
    for incident in incidents {
        match incident.status {
            IncidentStatus::Pending => buckets.pending.push(incident),
            IncidentStatus::Dispatched => buckets.active.push(incident),
            IncidentStatus::Resolved => buckets.resolved.push(incident),
        }
    }
    buckets
}

// ============================================================================
// Unit/incident join
// ============================================================================

/// The dispatched incident a unit is working, if any.
///
/// `incidents` is expected newest first; the first match wins.
pub fn active_incident_for<'a>(unit: &str, incidents: &'a [Incident]) -> Option<&'a Incident> {
    incidents
        .iter()
        .find(|incident| incident.status == IncidentStatus::Dispatched && incident.is_assigned_to(unit))
}

/// Every dispatched incident a unit is assigned to.
pub fn incidents_for_unit<'a>(unit: &str, incidents: &'a [Incident]) -> Vec<&'a Incident> {
    incidents
        .iter()
        .filter(|incident| incident.status == IncidentStatus::Dispatched && incident.is_assigned_to(unit))
        .collect()
}

/// A unit found on more than one dispatched incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentConflict {
    pub unit: String,
    pub incident_ids: Vec<String>,
}

/// Units assigned to several dispatched incidents at once, by unit number.
pub fn assignment_conflicts(incidents: &[Incident]) -> Vec<AssignmentConflict> {
    let mut by_unit: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    for incident in incidents
        .iter()
        .filter(|incident| incident.status == IncidentStatus::Dispatched)
    {
        for unit in &incident.assigned_units {
            let ids = by_unit.entry(unit.as_str()).or_default();
            if !ids.contains(&incident.id) {
                ids.push(incident.id.clone());
            }
        }
    }

    by_unit
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(unit, incident_ids)| AssignmentConflict {
            unit: unit.to_string(),
            incident_ids,
        })
        .collect()
}

// ============================================================================
// Unit lists
// ============================================================================

/// Units on shift (not offline), in display order.
pub fn online_units(units: &[Unit]) -> Vec<Unit> {
    let mut online: Vec<Unit> = units
        .iter()
        .filter(|unit| unit.status != UnitStatus::Offline)
        .cloned()
        .collect();
    sort_units(&mut online);
    online
}

/// Unit numbers that can take a call.
pub fn available_unit_numbers(units: &[Unit]) -> Vec<String> {
    units
        .iter()
        .filter(|unit| unit.status == UnitStatus::Available)
        .map(|unit| unit.unit_number.clone())
        .collect()
}

// ============================================================================
// BOLOs
// ============================================================================

/// BOLOs grouped by their status at `now`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BoloBoard {
    pub active: Vec<Bolo>,
    pub resolved: Vec<Bolo>,
    pub expired: Vec<Bolo>,
}

/// Group BOLOs by effective status, each group ordered by priority then age.
pub fn bolo_board(bolos: Vec<Bolo>, now: DateTime<Utc>) -> BoloBoard {
    let mut board = BoloBoard::default();
    for bolo in bolos {
        match bolo.effective_status(now) {
            BoloStatus::Active => board.active.push(bolo),
            BoloStatus::Resolved => board.resolved.push(bolo),
            BoloStatus::Expired => board.expired.push(bolo),
        }
    }
    sort_bolos(&mut board.active);
    sort_bolos(&mut board.resolved);
    sort_bolos(&mut board.expired);
    board
}

/// BOLOs still in force at `now`.
pub fn active_bolos(bolos: Vec<Bolo>, now: DateTime<Utc>) -> Vec<Bolo> {
    bolo_board(bolos, now).active
}
