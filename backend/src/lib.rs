//! Home battery reserve scheduling backend
//!
//! Core services of the reserve scheduler:
//! - Rule compilation into boundary triggers and their cron recurrences
//! - Cron-driven reconciliation of each site's backup reserve
//! - Continuous re-assertion and startup misfire recovery
//! - Per-user credential lifecycle for the Device API

pub mod config;
pub mod db;
pub mod error;
pub mod integrations;
pub mod models;
pub mod schema;
pub mod services;
pub mod store;

#[cfg(test)]
mod test_support;
