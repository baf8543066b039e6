//! Historical crash-event access port trait.

use crate::domain::crash_event::CrashEvent;
use crate::domain::error::RebounderError;
use chrono::NaiveDate;

pub trait HistoryPort {
    /// Crash events for one instrument with reference dates in `[start, end]`,
    /// ordered by date.
    fn crash_events(
        &self,
        instrument: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CrashEvent>, RebounderError>;

    /// Every crash event with a reference date in `[start, end]`, ordered by
    /// (instrument, date).
    fn crash_events_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CrashEvent>, RebounderError>;

    fn list_instruments(&self) -> Result<Vec<String>, RebounderError>;
}
