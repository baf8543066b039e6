//! rebounder: crash-rebound exit-policy optimizer and position-lifecycle
//! engine.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`]. [`self_test`] replays history
//! through the live manager; [`cli`] wires everything to the command line.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod ports;
