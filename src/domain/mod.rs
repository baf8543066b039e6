//! Core domain types and logic.

pub mod calibrator;
pub mod config_validation;
pub mod crash_event;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod notifier;
pub mod optimizer;
pub mod policy;
pub mod position;
pub mod simulator;
pub mod stats;
pub mod summary;
