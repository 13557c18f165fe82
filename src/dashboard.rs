//! Role dashboards.
//!
//! A dashboard is composed from live queries over the store and rebuilt from
//! the latest snapshots whenever one of them changes. Which composition a
//! caller gets is decided by the role in its [`Session`]:
//!
//! - dispatch: pending/active/recent calls, units in status order, BOLOs
//! - unit: its own status, active call, past calls, shift log, radio channels
//! - supervisor: the dispatch board plus shift overview and analytics
//!
//! # Usage
//!
//! ```ignore
//! let mut feed = DashboardFeed::open(&storage, session);
//! while let Some(view) = feed.next().await? {
//!     render(view);
//! }
//! // dropping the feed releases every subscription it opened
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::derived::{
    AssignmentConflict, BoloBoard, PAST_CALLS_LIMIT, active_bolos, active_incident_for,
    assignment_conflicts, available_unit_numbers, bolo_board, classify_incidents, online_units,
    sort_newest_first, sort_units,
};
use crate::error::Result;
use crate::model::{
    Bolo, Incident, IncidentStatus, Priority, RadioChannel, ShiftKind, ShiftLogEntry, Unit,
    UnitStatus,
};
use crate::live::{LiveQuery, Subscription};
use crate::operations::start_of_day;
use crate::roles::{DashboardKind, Role, Session};
use crate::storage::{BOLOS, INCIDENTS, SHIFT_LOGS, Storage, UNITS};

/// Summary statistics for the incident board.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub total_incidents: usize,
    pub pending_count: usize,
    pub active_count: usize,
    pub resolved_count: usize,

    /// Open calls flagged Code Red.
    pub code_red_count: usize,

    /// Units currently in panic.
    pub panic_count: usize,

    /// Open calls by priority.
    pub by_priority: HashMap<String, usize>,
}

impl DashboardSummary {
    /// Compute the summary from incident and unit snapshots.
    pub fn from_snapshots(incidents: &[Incident], units: &[Unit]) -> Self {
        let mut summary = Self {
            total_incidents: incidents.len(),
            ..Self::default()
        };

        for incident in incidents {
            match incident.status {
                IncidentStatus::Pending => summary.pending_count += 1,
                IncidentStatus::Dispatched => summary.active_count += 1,
                IncidentStatus::Resolved => summary.resolved_count += 1,
            }
            if incident.status != IncidentStatus::Resolved {
                if incident.code_red {
                    summary.code_red_count += 1;
                }
                *summary
                    .by_priority
                    .entry(incident.priority.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        summary.panic_count = units
            .iter()
            .filter(|unit| unit.status == UnitStatus::Panic)
            .count();

        summary
    }
}

/// A unit row on the dispatch board.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitRow {
    #[serde(flatten)]
    pub unit: Unit,
    pub active_incident_id: Option<String>,
}

/// The dispatch console.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchView {
    pub generated_at: DateTime<Utc>,
    pub summary: DashboardSummary,
    pub pending: Vec<Incident>,
    pub active: Vec<Incident>,
    pub recently_resolved: Vec<Incident>,
    pub units: Vec<UnitRow>,
    pub available_units: Vec<String>,
    pub conflicts: Vec<AssignmentConflict>,
    pub bolos: Vec<Bolo>,
}

impl DispatchView {
    pub fn build(
        incidents: Vec<Incident>,
        units: &[Unit],
        bolos: Vec<Bolo>,
        now: DateTime<Utc>,
    ) -> Self {
        let summary = DashboardSummary::from_snapshots(&incidents, units);
        let conflicts = assignment_conflicts(&incidents);
        let available_units = available_in_order(units);
        let buckets = classify_incidents(incidents);

        let rows = online_units(units)
            .into_iter()
            .map(|unit| UnitRow {
                active_incident_id: active_incident_for(&unit.unit_number, &buckets.active)
                    .map(|incident| incident.id.clone()),
                unit,
            })
            .collect();

        Self {
            generated_at: now,
            summary,
            recently_resolved: buckets.recently_resolved().to_vec(),
            pending: buckets.pending,
            active: buckets.active,
            units: rows,
            available_units,
            conflicts,
            bolos: active_bolos(bolos, now),
        }
    }
}

fn available_in_order(units: &[Unit]) -> Vec<String> {
    let mut available: Vec<Unit> = units
        .iter()
        .filter(|unit| unit.status == UnitStatus::Available)
        .cloned()
        .collect();
    sort_units(&mut available);
    available_unit_numbers(&available)
}

/// The console of a unit in the field.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitView {
    pub generated_at: DateTime<Utc>,
    pub unit_number: String,
    pub unit: Option<Unit>,

    /// The unit was removed from the shift by dispatch and must log in again.
    pub kicked: bool,

    pub active_incident: Option<Incident>,
    pub open_incidents: Vec<Incident>,
    pub past_calls: Vec<Incident>,
    pub online_units: Vec<Unit>,
    pub bolos: Vec<Bolo>,
    pub shift_log: Vec<ShiftLogEntry>,
    pub channels: Vec<RadioChannel>,
}

impl UnitView {
    pub fn build(
        unit_number: &str,
        incidents: Vec<Incident>,
        units: &[Unit],
        bolos: Vec<Bolo>,
        past_calls: Vec<Incident>,
        shift_log: Vec<ShiftLogEntry>,
        now: DateTime<Utc>,
    ) -> Self {
        let unit = units
            .iter()
            .find(|unit| unit.unit_number == unit_number)
            .cloned();
        let kicked = unit
            .as_ref()
            .is_some_and(|unit| unit.status == UnitStatus::Offline && unit.kicked_by.is_some());

        let mut channels = vec![RadioChannel::Dispatch];
        if let Some(unit) = &unit {
            for channel in &unit.active_channels {
                if !channels.contains(channel) {
                    channels.push(*channel);
                }
            }
        }

        let buckets = classify_incidents(incidents);
        let active_incident = active_incident_for(unit_number, &buckets.active).cloned();

        let since = start_of_day(now);
        let shift_log = shift_log
            .into_iter()
            .filter(|entry| entry.timestamp.is_some_and(|ts| ts >= since))
            .collect();

        Self {
            generated_at: now,
            unit_number: unit_number.to_string(),
            unit,
            kicked,
            active_incident,
            open_incidents: buckets.open(),
            past_calls,
            online_units: online_units(units),
            bolos: active_bolos(bolos, now),
            shift_log,
            channels,
        }
    }
}

/// Counts for the shift in progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftOverview {
    pub shift: ShiftKind,
    pub label: &'static str,
    pub online_units: usize,
    pub units_by_status: HashMap<String, usize>,
    pub incidents_by_status: HashMap<String, usize>,
}

impl ShiftOverview {
    pub fn compute(units: &[Unit], incidents: &[Incident], now: DateTime<Utc>) -> Self {
        let shift = ShiftKind::at(now);

        let mut units_by_status: HashMap<String, usize> = HashMap::new();
        for unit in units {
            *units_by_status
                .entry(unit.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        let mut incidents_by_status: HashMap<String, usize> = HashMap::new();
        for incident in incidents {
            *incidents_by_status
                .entry(incident.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        Self {
            shift,
            label: shift.label(),
            online_units: units
                .iter()
                .filter(|unit| unit.status != UnitStatus::Offline)
                .count(),
            units_by_status,
            incidents_by_status,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl PriorityCounts {
    fn count<'a>(incidents: impl IntoIterator<Item = &'a Incident>) -> Self {
        let mut counts = Self::default();
        for incident in incidents {
            match incident.priority {
                Priority::High => counts.high += 1,
                Priority::Medium => counts.medium += 1,
                Priority::Low => counts.low += 1,
            }
        }
        counts
    }
}

/// Minutes from creation to last update, averaged over resolved incidents.
fn average_response_minutes<'a>(incidents: impl IntoIterator<Item = &'a Incident>) -> Option<f64> {
    let durations: Vec<f64> = incidents
        .into_iter()
        .filter(|incident| incident.status == IncidentStatus::Resolved)
        .filter_map(|incident| match (incident.timestamp, incident.updated_at) {
            (Some(start), Some(end)) if end >= start => {
                Some((end - start).num_seconds() as f64 / 60.0)
            }
            _ => None,
        })
        .collect();

    if durations.is_empty() {
        return None;
    }
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;
    Some((mean * 10.0).round() / 10.0)
}

/// Today's incident figures.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentAnalytics {
    pub total_today: usize,
    pub resolved_today: usize,
    pub average_response_minutes: Option<f64>,
    pub by_priority: PriorityCounts,
}

impl IncidentAnalytics {
    pub fn compute(incidents: &[Incident], now: DateTime<Utc>) -> Self {
        let since = start_of_day(now);
        let today: Vec<&Incident> = incidents
            .iter()
            .filter(|incident| incident.timestamp.is_some_and(|ts| ts >= since))
            .collect();

        Self {
            total_today: today.len(),
            resolved_today: today
                .iter()
                .filter(|incident| incident.status == IncidentStatus::Resolved)
                .count(),
            average_response_minutes: average_response_minutes(today.iter().copied()),
            by_priority: PriorityCounts::count(today.iter().copied()),
        }
    }
}

/// Per-unit call figures.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitMetrics {
    pub unit_number: String,
    pub status: UnitStatus,
    pub total_calls: usize,
    pub resolved_calls: usize,
    pub average_response_minutes: Option<f64>,
    pub by_priority: PriorityCounts,
}

impl UnitMetrics {
    /// Metrics for every unit, in display order.
    pub fn for_units(units: &[Unit], incidents: &[Incident]) -> Vec<Self> {
        let mut ordered = units.to_vec();
        sort_units(&mut ordered);

        ordered
            .into_iter()
            .map(|unit| {
                let calls: Vec<&Incident> = incidents
                    .iter()
                    .filter(|incident| incident.is_assigned_to(&unit.unit_number))
                    .collect();

                Self {
                    total_calls: calls.len(),
                    resolved_calls: calls
                        .iter()
                        .filter(|incident| incident.status == IncidentStatus::Resolved)
                        .count(),
                    average_response_minutes: average_response_minutes(calls.iter().copied()),
                    by_priority: PriorityCounts::count(calls.iter().copied()),
                    status: unit.status,
                    unit_number: unit.unit_number,
                }
            })
            .collect()
    }
}

/// The supervisor console: the dispatch board plus shift figures.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorView {
    #[serde(flatten)]
    pub board: DispatchView,
    pub overview: ShiftOverview,
    pub analytics: IncidentAnalytics,
    pub unit_metrics: Vec<UnitMetrics>,
}

impl SupervisorView {
    pub fn build(
        incidents: Vec<Incident>,
        units: &[Unit],
        bolos: Vec<Bolo>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            overview: ShiftOverview::compute(units, &incidents, now),
            analytics: IncidentAnalytics::compute(&incidents, now),
            unit_metrics: UnitMetrics::for_units(units, &incidents),
            board: DispatchView::build(incidents, units, bolos, now),
        }
    }
}

/// The view a session sees.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DashboardView {
    Dispatch(DispatchView),
    Unit(UnitView),
    Supervisor(SupervisorView),
}

/// The BOLO board at `now`.
pub async fn bolo_view(storage: &Storage, now: DateTime<Utc>) -> Result<BoloBoard> {
    let bolos = storage.list::<Bolo>(BOLOS).await?;
    Ok(bolo_board(bolos, now))
}

/// Live queries only a unit dashboard holds.
struct UnitFeeds {
    past_calls: Subscription<Incident>,
    shift_log: Subscription<ShiftLogEntry>,
}

#[derive(Default)]
struct Latest {
    incidents: Vec<Incident>,
    units: Vec<Unit>,
    bolos: Vec<Bolo>,
    past_calls: Vec<Incident>,
    shift_log: Vec<ShiftLogEntry>,
}

enum Changed {
    Incidents,
    Units,
    Bolos,
    PastCalls,
    ShiftLog,
    Closed,
}

/// A mounted dashboard.
///
/// Opening a feed subscribes to every query its view needs. Dropping it
/// releases them all, including ones that never delivered.
pub struct DashboardFeed {
    session: Session,
    incidents: Subscription<Incident>,
    units: Subscription<Unit>,
    bolos: Subscription<Bolo>,
    unit_feeds: Option<UnitFeeds>,
    latest: Latest,
    primed: bool,
    revision: u64,
}

impl DashboardFeed {
    pub fn open(storage: &Storage, session: Session) -> Self {
        let unit_feeds = match session.role.dashboard() {
            DashboardKind::Unit => {
                let unit = session.identity.clone();
                let log_unit = session.identity.clone();

                Some(UnitFeeds {
                    past_calls: storage.subscribe(
                        LiveQuery::<Incident>::collection(INCIDENTS)
                            .filter(|incident| incident.status == IncidentStatus::Resolved)
                            .filter(move |incident| incident.is_assigned_to(&unit))
                            .order_by(sort_newest_first::<Incident>)
                            .limit(PAST_CALLS_LIMIT),
                    ),
                    shift_log: storage.subscribe(
                        LiveQuery::<ShiftLogEntry>::collection(SHIFT_LOGS)
                            .filter(move |entry| entry.unit_number == log_unit)
                            .order_by(sort_newest_first::<ShiftLogEntry>),
                    ),
                })
            }
            DashboardKind::Dispatch | DashboardKind::Supervisor => None,
        };

        debug!(
            role = session.role.as_str(),
            identity = %session.identity,
            "Dashboard mounted"
        );

        Self {
            incidents: storage.subscribe(LiveQuery::collection(INCIDENTS)),
            units: storage.subscribe(LiveQuery::collection(UNITS)),
            bolos: storage.subscribe(LiveQuery::collection(BOLOS)),
            unit_feeds,
            session,
            latest: Latest::default(),
            primed: false,
            revision: 0,
        }
    }

    /// Views built so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Wait for the next view. The first call returns immediately; later
    /// calls wait until a query result changes. `None` once the store's
    /// change feed has closed.
    pub async fn next(&mut self) -> Result<Option<DashboardView>> {
        if !self.primed {
            if !self.prime().await? {
                return Ok(None);
            }
            self.primed = true;
        } else {
            match self.wait().await {
                Changed::Incidents => self.latest.incidents = self.incidents.snapshot().await?.docs,
                Changed::Units => self.latest.units = self.units.snapshot().await?.docs,
                Changed::Bolos => self.latest.bolos = self.bolos.snapshot().await?.docs,
                Changed::PastCalls => {
                    if let Some(feeds) = &mut self.unit_feeds {
                        self.latest.past_calls = feeds.past_calls.snapshot().await?.docs;
                    }
                }
                Changed::ShiftLog => {
                    if let Some(feeds) = &mut self.unit_feeds {
                        self.latest.shift_log = feeds.shift_log.snapshot().await?.docs;
                    }
                }
                Changed::Closed => return Ok(None),
            }
        }

        self.revision += 1;
        Ok(Some(self.view(Utc::now())))
    }

    async fn prime(&mut self) -> Result<bool> {
        let (Some(incidents), Some(units), Some(bolos)) = (
            self.incidents.next().await?,
            self.units.next().await?,
            self.bolos.next().await?,
        ) else {
            return Ok(false);
        };
        self.latest.incidents = incidents.docs;
        self.latest.units = units.docs;
        self.latest.bolos = bolos.docs;

        if let Some(feeds) = &mut self.unit_feeds {
            let (Some(past_calls), Some(shift_log)) =
                (feeds.past_calls.next().await?, feeds.shift_log.next().await?)
            else {
                return Ok(false);
            };
            self.latest.past_calls = past_calls.docs;
            self.latest.shift_log = shift_log.docs;
        }
        Ok(true)
    }

    async fn wait(&mut self) -> Changed {
        let unit_feeds = self.unit_feeds.as_mut();
        let (past_calls, shift_log) = match unit_feeds {
            Some(feeds) => (Some(&mut feeds.past_calls), Some(&mut feeds.shift_log)),
            None => (None, None),
        };

        let (open, changed) = tokio::select! {
            open = self.incidents.changed() => (open, Changed::Incidents),
            open = self.units.changed() => (open, Changed::Units),
            open = self.bolos.changed() => (open, Changed::Bolos),
            open = changed_or_pending(past_calls) => (open, Changed::PastCalls),
            open = changed_or_pending(shift_log) => (open, Changed::ShiftLog),
        };

        if open { changed } else { Changed::Closed }
    }

    fn view(&self, now: DateTime<Utc>) -> DashboardView {
        let latest = &self.latest;
        match self.session.role {
            Role::Dispatch => DashboardView::Dispatch(DispatchView::build(
                latest.incidents.clone(),
                &latest.units,
                latest.bolos.clone(),
                now,
            )),
            Role::Supervisor => DashboardView::Supervisor(SupervisorView::build(
                latest.incidents.clone(),
                &latest.units,
                latest.bolos.clone(),
                now,
            )),
            Role::Unit => DashboardView::Unit(UnitView::build(
                &self.session.identity,
                latest.incidents.clone(),
                &latest.units,
                latest.bolos.clone(),
                latest.past_calls.clone(),
                latest.shift_log.clone(),
                now,
            )),
        }
    }
}

async fn changed_or_pending<T: serde::de::DeserializeOwned>(
    subscription: Option<&mut Subscription<T>>,
) -> bool {
    match subscription {
        Some(subscription) => subscription.changed().await,
        None => std::future::pending().await,
    }
}

/// Build the session's view once. The feed is released before returning.
pub async fn load_dashboard(storage: &Storage, session: Session) -> Result<Option<DashboardView>> {
    let mut feed = DashboardFeed::open(storage, session);
    feed.next().await
}
