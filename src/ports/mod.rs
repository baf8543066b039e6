//! Port traits: the seams between the engine and its collaborators.

pub mod config_port;
pub mod execution_port;
pub mod history_port;
pub mod notify_port;
pub mod report_port;
pub mod scoring_port;
pub mod state_port;
