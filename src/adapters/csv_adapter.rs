//! CSV crash-event adapter.
//!
//! One row per forward period:
//!
//! ```text
//! instrument,date,close,crash_pct,volume,rebound_probability,period,ret,high,low
//! 005930,2024-03-04,100.0,-12.5,2000000,0.71,1,0.012,102.0,99.1
//! ```
//!
//! Rows of one event share `(instrument, date)` and carry periods `1..=n` in
//! order. An event without a forward window is a single row with the period
//! columns left empty. `rebound_probability` may be empty.

use crate::domain::crash_event::{CrashEvent, ForwardPeriod};
use crate::domain::error::RebounderError;
use crate::ports::history_port::HistoryPort;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct EventRow {
    instrument: String,
    date: String,
    close: f64,
    crash_pct: f64,
    volume: i64,
    rebound_probability: Option<f64>,
    period: Option<usize>,
    ret: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
}

pub struct CsvAdapter {
    path: PathBuf,
}

impl CsvAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every event in the file, ordered by (instrument, date).
    pub fn load(&self) -> Result<Vec<CrashEvent>, RebounderError> {
        let mut reader = csv::Reader::from_path(&self.path).map_err(|e| self.invalid(0, e))?;
        let mut events: Vec<CrashEvent> = Vec::new();

        for (i, result) in reader.deserialize::<EventRow>().enumerate() {
            // header is line 1
            let line = i + 2;
            let row = result.map_err(|e| self.invalid(line, e))?;
            let date = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d")
                .map_err(|e| self.invalid(line, e))?;
            if row.close <= 0.0 {
                return Err(self.invalid(line, format!("close must be positive, got {}", row.close)));
            }
            if let Some(p) = row.rebound_probability {
                if !(0.0..=1.0).contains(&p) {
                    return Err(self.invalid(line, format!("rebound_probability {p} outside [0, 1]")));
                }
            }

            let same = events
                .last()
                .is_some_and(|e| e.instrument == row.instrument && e.date == date);
            if !same {
                events.push(CrashEvent {
                    instrument: row.instrument.clone(),
                    date,
                    close: row.close,
                    crash_pct: row.crash_pct,
                    volume: row.volume,
                    forward: Vec::new(),
                    rebound_probability: row.rebound_probability,
                });
            }
            let Some(event) = events.last_mut() else {
                continue;
            };

            match (row.period, row.ret, row.high, row.low) {
                (None, None, None, None) => {}
                (Some(period), Some(ret), Some(high), Some(low)) => {
                    if period != event.forward.len() + 1 {
                        return Err(self.invalid(
                            line,
                            format!(
                                "expected period {} for {} {}, got {period}",
                                event.forward.len() + 1,
                                event.instrument,
                                event.date
                            ),
                        ));
                    }
                    event.forward.push(ForwardPeriod { ret, high, low });
                }
                _ => {
                    return Err(self.invalid(line, "period, ret, high and low must all be set or all be empty"));
                }
            }
        }

        events.sort_by(|a, b| (&a.instrument, a.date).cmp(&(&b.instrument, b.date)));
        for pair in events.windows(2) {
            if pair[0].instrument == pair[1].instrument && pair[0].date == pair[1].date {
                return Err(self.invalid(
                    0,
                    format!("event {} {} appears in two separate blocks", pair[0].instrument, pair[0].date),
                ));
            }
        }
        Ok(events)
    }

    fn invalid(&self, line: usize, reason: impl ToString) -> RebounderError {
        let location = if line > 0 {
            format!("{}:{}", self.path.display(), line)
        } else {
            self.path.display().to_string()
        };
        RebounderError::InvalidInput {
            reason: format!("{location}: {}", reason.to_string()),
        }
    }
}

impl HistoryPort for CsvAdapter {
    fn crash_events(
        &self,
        instrument: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CrashEvent>, RebounderError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| e.instrument == instrument && e.date >= start && e.date <= end)
            .collect())
    }

    fn crash_events_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CrashEvent>, RebounderError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| e.date >= start && e.date <= end)
            .collect())
    }

    fn list_instruments(&self) -> Result<Vec<String>, RebounderError> {
        let mut instruments: Vec<String> =
            self.load()?.into_iter().map(|e| e.instrument).collect();
        instruments.dedup();
        Ok(instruments)
    }
}
