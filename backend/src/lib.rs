//! # Fleet Dispatch
//!
//! Double-booking prevention and conflict resolution for bus operations.
//!
//! A trip assignment (a [`models::Schedule`]) binds one driver and one vehicle
//! to a time window on a service date. This crate keeps those windows from
//! colliding and helps dispatchers fix the ones that do.
//!
//! ## Features
//!
//! - **Conflict Detection**: Buffered overlap checks run under per-(driver, date)
//!   and per-(vehicle, date) locks before any write is committed
//! - **Resolution Planning**: Ranked reassign, reschedule and swap options,
//!   each validated against the current calendar
//! - **Atomic Resolution**: All-or-nothing application with stale-option detection
//! - **Risk Analysis**: Per-schedule risk tiers and fleet-wide patterns,
//!   cached and refreshed periodically
//! - **Notifications**: Non-blocking, role- and driver-addressed events
//!
//! ## Architecture
//!
//! - [`config`]: TOML configuration with defaults
//! - [`models`]: Domain types shared by every layer
//! - [`db`]: Repository traits and the in-memory implementation
//! - [`services`]: Detection, planning, execution, risk analysis, notification

// Allow large error types - RepositoryError contains rich context for debugging
#![allow(clippy::result_large_err)]

pub mod config;
pub mod db;
pub mod models;
pub mod services;
