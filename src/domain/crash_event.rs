//! Historical crash events and their forward windows.

use chrono::NaiveDate;
use std::collections::HashSet;

use super::simulator::PeriodExtremes;

/// One period after the crash: its return plus the period's high and low
/// prices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardPeriod {
    pub ret: f64,
    pub high: f64,
    pub low: f64,
}

/// An instrument on a date where its period return fell below the crash
/// threshold. Read-only to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CrashEvent {
    pub instrument: String,
    pub date: NaiveDate,
    pub close: f64,
    /// Crash magnitude in percent, e.g. `-12.5`.
    pub crash_pct: f64,
    pub volume: i64,
    pub forward: Vec<ForwardPeriod>,
    pub rebound_probability: Option<f64>,
}

impl CrashEvent {
    pub fn forward_returns(&self) -> Vec<f64> {
        self.forward.iter().map(|p| p.ret).collect()
    }

    /// Best high within the first `window` periods, as a return on the
    /// reference close.
    pub fn max_excursion(&self, window: usize) -> Option<f64> {
        if self.close <= 0.0 {
            return None;
        }
        self.forward
            .iter()
            .take(window)
            .map(|p| p.high)
            .fold(None, |acc: Option<f64>, h| Some(acc.map_or(h, |a| a.max(h))))
            .map(|h| h / self.close - 1.0)
    }

    /// Worst low within the first `window` periods, as a return on the
    /// reference close.
    pub fn min_excursion(&self, window: usize) -> Option<f64> {
        if self.close <= 0.0 {
            return None;
        }
        self.forward
            .iter()
            .take(window)
            .map(|p| p.low)
            .fold(None, |acc: Option<f64>, l| Some(acc.map_or(l, |a| a.min(l))))
            .map(|l| l / self.close - 1.0)
    }

    pub fn max_forward_return(&self) -> Option<f64> {
        self.max_excursion(self.forward.len())
    }

    /// 1-based period of the highest high; the earliest wins on ties.
    pub fn day_of_max(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, p) in self.forward.iter().enumerate() {
            match best {
                Some((_, h)) if p.high <= h => {}
                _ => best = Some((i + 1, p.high)),
            }
        }
        best.map(|(day, _)| day)
    }

    /// Cumulative close/high/low path relative to the reference close.
    ///
    /// Close is the running sum of period returns. High and low come from
    /// the recorded prices but never sit inside the close path.
    pub fn cumulative_path(&self) -> Vec<PeriodExtremes> {
        let mut cumulative = 0.0;
        self.forward
            .iter()
            .map(|p| {
                cumulative += p.ret;
                let (high, low) = if self.close > 0.0 {
                    (p.high / self.close - 1.0, p.low / self.close - 1.0)
                } else {
                    (cumulative, cumulative)
                };
                PeriodExtremes {
                    close: cumulative,
                    high: high.max(cumulative),
                    low: low.min(cumulative),
                }
            })
            .collect()
    }

    pub fn is_liquid(&self, min_volume: i64) -> bool {
        self.volume >= min_volume
    }

    /// Probability present and at or above `threshold`.
    pub fn is_accepted(&self, threshold: f64) -> bool {
        self.rebound_probability.is_some_and(|p| p >= threshold)
    }

    /// Sort by (instrument, date) and keep the first event per pair.
    pub fn dedup(mut events: Vec<CrashEvent>) -> Vec<CrashEvent> {
        events.sort_by(|a, b| a.instrument.cmp(&b.instrument).then(a.date.cmp(&b.date)));
        let mut seen = HashSet::new();
        events.retain(|e| seen.insert((e.instrument.clone(), e.date)));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn period(ret: f64, high: f64, low: f64) -> ForwardPeriod {
        ForwardPeriod { ret, high, low }
    }

    fn sample_event() -> CrashEvent {
        CrashEvent {
            instrument: "005930".into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            close: 100.0,
            crash_pct: -12.0,
            volume: 2_000_000,
            forward: vec![
                period(0.02, 104.0, 97.0),
                period(0.03, 109.0, 101.0),
                period(-0.01, 106.0, 95.0),
            ],
            rebound_probability: Some(0.7),
        }
    }

    #[test]
    fn forward_returns_in_order() {
        assert_eq!(sample_event().forward_returns(), vec![0.02, 0.03, -0.01]);
    }

    #[test]
    fn excursions_use_highs_and_lows() {
        let e = sample_event();
        assert_relative_eq!(e.max_excursion(5).unwrap(), 0.09, epsilon = 1e-12);
        assert_relative_eq!(e.max_excursion(1).unwrap(), 0.04, epsilon = 1e-12);
        assert_relative_eq!(e.min_excursion(5).unwrap(), -0.05, epsilon = 1e-12);
        assert_relative_eq!(e.min_excursion(2).unwrap(), -0.03, epsilon = 1e-12);
    }

    #[test]
    fn excursions_empty_window() {
        let mut e = sample_event();
        e.forward.clear();
        assert!(e.max_excursion(5).is_none());
        assert!(e.min_excursion(5).is_none());
        assert!(e.day_of_max().is_none());
    }

    #[test]
    fn derived_statistics() {
        let e = sample_event();
        assert_relative_eq!(e.max_forward_return().unwrap(), 0.09, epsilon = 1e-12);
        assert_eq!(e.day_of_max(), Some(2));
    }

    #[test]
    fn cumulative_path_brackets_close() {
        let path = sample_event().cumulative_path();
        assert_eq!(path.len(), 3);
        assert_relative_eq!(path[1].close, 0.05, epsilon = 1e-12);
        assert_relative_eq!(path[1].high, 0.09, epsilon = 1e-12);
        assert_relative_eq!(path[1].low, 0.01, epsilon = 1e-12);
        for p in &path {
            assert!(p.low <= p.close && p.close <= p.high);
        }
    }

    #[test]
    fn acceptance_requires_probability() {
        let mut e = sample_event();
        assert!(e.is_accepted(0.6));
        assert!(e.is_accepted(0.7));
        assert!(!e.is_accepted(0.71));
        e.rebound_probability = None;
        assert!(!e.is_accepted(0.0));
    }

    #[test]
    fn dedup_keeps_one_event_per_instrument_and_date() {
        let a = sample_event();
        let mut b = sample_event();
        b.crash_pct = -20.0;
        let mut c = sample_event();
        c.date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let events = CrashEvent::dedup(vec![a.clone(), b, c.clone()]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], c);
        assert_eq!(events[1], a);
    }
}
