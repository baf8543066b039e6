//! Rebound-probability scoring port trait.

use crate::domain::crash_event::CrashEvent;
use crate::domain::error::RebounderError;

/// Black-box model producing a rebound probability in `[0, 1]`.
pub trait ScoringPort: Send + Sync {
    fn score(&self, event: &CrashEvent) -> Result<f64, RebounderError>;
}
