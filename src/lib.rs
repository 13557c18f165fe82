//! CAD console - dispatch, unit and supervisor consoles for a role-play
//! computer-aided dispatch system.
//!
//! # Overview
//!
//! Incidents, units, BOLOs, radio traffic and shift logs live as documents in
//! a store scoped to one role-play server (`T1S1` ... `T3S10`). Every console
//! is a set of live queries over that store; each view is rebuilt from the
//! latest snapshots through one shared derived-state module, so the dispatch,
//! unit and supervisor consoles always agree on ordering and grouping.
//!
//! The role of a caller is fixed when its session is issued. Capabilities
//! are checked on the server before every write, and the supervisor role
//! requires a credential configured for the service.
//!
//! # Modules
//!
//! - [`model`]: Incidents, units, BOLOs, radio messages, shift logs and request bodies
//! - [`storage`]: SQLite document store with merge-upsert, array-union and a change feed
//! - [`live`]: Live queries delivering full snapshots, released on drop
//! - [`derived`]: Status ranking, newest-first ordering, incident buckets, unit/incident join
//! - [`roles`]: Roles, capability table and sessions
//! - [`operations`]: Every mutation the consoles perform
//! - [`dashboard`]: Per-role views and the live dashboard feed
//! - [`api`]: HTTP API handlers
//! - [`config`]: Environment configuration
//! - [`error`]: Crate error type

pub mod api;
pub mod config;
pub mod dashboard;
pub mod derived;
pub mod error;
pub mod live;
pub mod model;
pub mod operations;
pub mod roles;
pub mod storage;
