#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use rebounder::domain::crash_event::{CrashEvent, ForwardPeriod};
use rebounder::domain::error::{Collaborator, RebounderError};
use rebounder::ports::history_port::HistoryPort;
use rebounder::ports::notify_port::{NotifyPort, TradeNotification};
use rebounder::ports::scoring_port::ScoringPort;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
    date(y, m, d).and_hms_opt(9, 30, 0).unwrap()
}

/// Crash event with a flat intraday range: each period's high and low equal
/// its close.
pub fn make_event(instrument: &str, day: NaiveDate, close: f64, returns: &[f64]) -> CrashEvent {
    let mut price = close;
    CrashEvent {
        instrument: instrument.to_string(),
        date: day,
        close,
        crash_pct: -12.0,
        volume: 5_000_000,
        forward: returns
            .iter()
            .map(|&ret| {
                price *= 1.0 + ret;
                ForwardPeriod {
                    ret,
                    high: price,
                    low: price,
                }
            })
            .collect(),
        rebound_probability: Some(0.8),
    }
}

pub fn with_probability(mut event: CrashEvent, probability: Option<f64>) -> CrashEvent {
    event.rebound_probability = probability;
    event
}

pub fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// History keyed by instrument; instruments listed in `errors` fail.
#[derive(Default)]
pub struct MockHistory {
    pub events: HashMap<String, Vec<CrashEvent>>,
    pub errors: HashMap<String, String>,
}

impl MockHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: Vec<CrashEvent>) -> Self {
        for event in events {
            self.events
                .entry(event.instrument.clone())
                .or_default()
                .push(event);
        }
        self
    }

    pub fn with_error(mut self, instrument: &str, reason: &str) -> Self {
        self.errors.insert(instrument.to_string(), reason.to_string());
        self
    }
}

impl HistoryPort for MockHistory {
    fn crash_events(
        &self,
        instrument: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CrashEvent>, RebounderError> {
        if let Some(reason) = self.errors.get(instrument) {
            return Err(RebounderError::collaborator(Collaborator::History, reason.clone()));
        }
        Ok(self
            .events
            .get(instrument)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.date >= start && e.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn crash_events_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CrashEvent>, RebounderError> {
        let mut all: Vec<CrashEvent> = self
            .events
            .values()
            .flatten()
            .filter(|e| e.date >= start && e.date <= end)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.instrument.cmp(&b.instrument).then(a.date.cmp(&b.date)));
        Ok(all)
    }

    fn list_instruments(&self) -> Result<Vec<String>, RebounderError> {
        let mut names: Vec<String> = self.events.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Fixed scores per instrument; unknown instruments fail.
#[derive(Default)]
pub struct MockScoring {
    pub scores: HashMap<String, f64>,
}

impl MockScoring {
    pub fn with_score(mut self, instrument: &str, score: f64) -> Self {
        self.scores.insert(instrument.to_string(), score);
        self
    }
}

impl ScoringPort for MockScoring {
    fn score(&self, event: &CrashEvent) -> Result<f64, RebounderError> {
        self.scores.get(&event.instrument).copied().ok_or_else(|| {
            RebounderError::collaborator(
                Collaborator::Scoring,
                format!("no model for {}", event.instrument),
            )
        })
    }
}

/// Records every notification it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    pub received: Mutex<Vec<TradeNotification>>,
}

impl RecordingNotifier {
    pub fn received(&self) -> Vec<TradeNotification> {
        self.received.lock().unwrap().clone()
    }
}

impl NotifyPort for RecordingNotifier {
    fn notify(&self, notification: &TradeNotification) -> Result<(), String> {
        self.received.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
