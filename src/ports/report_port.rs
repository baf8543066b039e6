//! Calibration report port trait.

use chrono::NaiveDate;

use crate::domain::calibrator::{AllocationComparison, Calibration, CapitalLevelResult};
use crate::domain::error::RebounderError;

/// Everything one calibration run produced.
pub struct CalibrationReport<'a> {
    pub generated: NaiveDate,
    /// Date range of the crash-event population.
    pub period: (NaiveDate, NaiveDate),
    pub calibration: &'a Calibration,
    pub allocation: Option<&'a AllocationComparison>,
    pub capital_levels: &'a [CapitalLevelResult],
}

pub trait ReportPort {
    fn write(&self, report: &CalibrationReport<'_>, output_path: &str) -> Result<(), RebounderError>;
}
