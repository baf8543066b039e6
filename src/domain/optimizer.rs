//! Exit-policy optimizer.
//!
//! Derives a per-instrument [`ExitPolicy`] from that instrument's own crash
//! analogs:
//!
//! - target profit: a high percentile of the best excursion (from period
//!   highs) inside the forward window, clamped to a band;
//! - stop loss: a configured constant, never derived from data;
//! - averaging trigger: the mean worst excursion (from period lows), clamped
//!   to a band, and dropped if it would not fire before the stop.
//!
//! Not enough history, or a history source that fails, yields the global
//! policy with the fallback recorded. The optimizer never fails its caller.

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::{debug, warn};

use super::crash_event::CrashEvent;
use super::error::RebounderError;
use super::policy::{ExitPolicy, PolicyScope};
use super::stats::{mean, percentile};
use crate::ports::history_port::HistoryPort;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub min_samples: usize,
    /// Forward periods inspected per event; also the derived policy's horizon.
    pub window: usize,
    pub target_percentile: f64,
    pub target_min: f64,
    pub target_max: f64,
    pub stop_loss: f64,
    pub averaging_min: f64,
    pub averaging_max: f64,
    pub lookback_days: i64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            min_samples: 1,
            window: 5,
            target_percentile: 75.0,
            target_min: 0.05,
            target_max: 0.20,
            stop_loss: -0.05,
            averaging_min: -0.05,
            averaging_max: -0.02,
            lookback_days: 730,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), RebounderError> {
        let invalid = |reason: String| Err(RebounderError::InvalidInput { reason });
        if self.min_samples == 0 {
            return invalid("optimizer min_samples must be at least 1".into());
        }
        if self.window == 0 {
            return invalid("optimizer window must be at least 1".into());
        }
        if !(0.0..=100.0).contains(&self.target_percentile) {
            return invalid(format!(
                "target percentile must be in [0, 100], got {}",
                self.target_percentile
            ));
        }
        if !(self.target_min > 0.0 && self.target_min <= self.target_max) {
            return invalid(format!(
                "target band [{}, {}] must be positive and ordered",
                self.target_min, self.target_max
            ));
        }
        if !(self.stop_loss < 0.0) {
            return invalid(format!("stop loss must be negative, got {}", self.stop_loss));
        }
        if !(self.averaging_min <= self.averaging_max && self.averaging_max < 0.0) {
            return invalid(format!(
                "averaging band [{}, {}] must be negative and ordered",
                self.averaging_min, self.averaging_max
            ));
        }
        if self.lookback_days <= 0 {
            return invalid(format!(
                "lookback must be positive, got {} days",
                self.lookback_days
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    InsufficientHistory,
    HistoryUnavailable,
    InvalidPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOrigin {
    Personalized,
    Fallback(FallbackReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizedPolicy {
    pub instrument: String,
    pub policy: ExitPolicy,
    pub origin: PolicyOrigin,
    pub scope: PolicyScope,
    /// Events that contributed to the derivation.
    pub samples: usize,
}

impl OptimizedPolicy {
    pub fn is_fallback(&self) -> bool {
        matches!(self.origin, PolicyOrigin::Fallback(_))
    }
}

pub struct ExitPolicyOptimizer {
    config: OptimizerConfig,
    global: ExitPolicy,
}

impl ExitPolicyOptimizer {
    pub fn new(config: OptimizerConfig, global: ExitPolicy) -> Self {
        ExitPolicyOptimizer { config, global }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Policy for `instrument` from crash events in the look-back window
    /// ending at `as_of`.
    pub fn optimize(
        &self,
        history: &dyn HistoryPort,
        instrument: &str,
        as_of: NaiveDate,
    ) -> OptimizedPolicy {
        let start = as_of - Duration::days(self.config.lookback_days);
        match history.crash_events(instrument, start, as_of) {
            Ok(events) => self.optimize_events(instrument, &events),
            Err(e) => {
                warn!(instrument, error = %e, "crash history unavailable, using global policy");
                self.fallback(instrument, FallbackReason::HistoryUnavailable, 0)
            }
        }
    }

    /// Policies for every instrument the history source knows about.
    pub fn optimize_all(
        &self,
        history: &dyn HistoryPort,
        as_of: NaiveDate,
    ) -> Result<Vec<OptimizedPolicy>, RebounderError> {
        let instruments = history.list_instruments()?;
        Ok(instruments
            .iter()
            .map(|instrument| self.optimize(history, instrument, as_of))
            .collect())
    }

    /// Derive a policy from an already-loaded event set.
    pub fn optimize_events(&self, instrument: &str, events: &[CrashEvent]) -> OptimizedPolicy {
        let window = self.config.window;
        let (highs, lows): (Vec<f64>, Vec<f64>) = events
            .iter()
            .filter_map(|e| Some((e.max_excursion(window)?, e.min_excursion(window)?)))
            .unzip();

        let samples = highs.len();
        if samples < self.config.min_samples {
            debug!(
                instrument,
                samples,
                need = self.config.min_samples,
                "too few crash analogs"
            );
            return self.fallback(instrument, FallbackReason::InsufficientHistory, samples);
        }

        let (Some(upside), Some(drawdown)) = (
            percentile(&highs, self.config.target_percentile),
            mean(&lows),
        ) else {
            return self.fallback(instrument, FallbackReason::InsufficientHistory, samples);
        };

        let target = upside.clamp(self.config.target_min, self.config.target_max);
        let averaging = drawdown.clamp(self.config.averaging_min, self.config.averaging_max);

        match ExitPolicy::new(target, self.config.stop_loss, None, window) {
            Ok(policy) => {
                let policy = policy.with_averaging_if_valid(Some(averaging));
                debug!(instrument, samples, %policy, "personalized policy");
                OptimizedPolicy {
                    instrument: instrument.to_string(),
                    policy,
                    origin: PolicyOrigin::Personalized,
                    scope: PolicyScope::PerInstrument,
                    samples,
                }
            }
            Err(e) => {
                warn!(instrument, error = %e, "derived policy invalid, using global policy");
                self.fallback(instrument, FallbackReason::InvalidPolicy, samples)
            }
        }
    }

    fn fallback(&self, instrument: &str, reason: FallbackReason, samples: usize) -> OptimizedPolicy {
        OptimizedPolicy {
            instrument: instrument.to_string(),
            policy: self.global,
            origin: PolicyOrigin::Fallback(reason),
            scope: PolicyScope::Global,
            samples,
        }
    }
}
