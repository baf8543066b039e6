//! Concrete adapter implementations for ports.

pub mod csv_adapter;
pub mod file_config_adapter;
pub mod log_notifier;
pub mod markdown_report;
pub mod paper_execution;
pub mod sqlite_adapter;
