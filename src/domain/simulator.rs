//! Trade simulator.
//!
//! Replays an [`ExitPolicy`] over a forward window of period returns and
//! reports how the trade would have ended. Every function here is pure: no
//! shared state, no I/O, identical output for identical input, so callers may
//! run it from any number of threads.
//!
//! Per period, after the period's return has been added to the running
//! cumulative return:
//!
//! 1. cumulative >= target profit: exit at the target (capped, as a resting
//!    limit order would fill at its price, not at the overshoot);
//! 2. else cumulative <= stop loss: exit at the stop (capped likewise);
//! 3. else if this is the last period of the horizon: exit at the actual
//!    cumulative return.
//!
//! Target profit is checked before stop loss. When a coarse period's high and
//! low cross both thresholds, the trade is booked as a target-profit exit.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use super::error::RebounderError;
use super::policy::ExitPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TargetProfit,
    StopLoss,
    HorizonExpiry,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TargetProfit => "target_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::HorizonExpiry => "horizon_expiry",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = RebounderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "target_profit" => Ok(ExitReason::TargetProfit),
            "stop_loss" => Ok(ExitReason::StopLoss),
            "horizon_expiry" => Ok(ExitReason::HorizonExpiry),
            other => Err(RebounderError::InvalidInput {
                reason: format!("unknown exit reason '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimulationResult {
    /// 1-based period of the exit.
    pub exit_period: usize,
    pub exit_return: f64,
    pub exit_price: f64,
    pub reason: ExitReason,
    pub success: bool,
}

/// Cumulative returns reached within one period, relative to the entry
/// reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodExtremes {
    pub close: f64,
    pub high: f64,
    pub low: f64,
}

impl PeriodExtremes {
    pub fn flat(cumulative: f64) -> Self {
        PeriodExtremes {
            close: cumulative,
            high: cumulative,
            low: cumulative,
        }
    }
}

/// Replay `policy` over close-to-close `forward_returns`.
pub fn simulate(
    entry_ref: f64,
    forward_returns: &[f64],
    policy: &ExitPolicy,
) -> Result<SimulationResult, RebounderError> {
    let mut cumulative = 0.0;
    let path: Vec<PeriodExtremes> = forward_returns
        .iter()
        .map(|r| {
            cumulative += r;
            PeriodExtremes::flat(cumulative)
        })
        .collect();
    simulate_path(entry_ref, &path, policy)
}

/// Replay `policy` over a path that also carries each period's cumulative
/// high and low.
pub fn simulate_path(
    entry_ref: f64,
    path: &[PeriodExtremes],
    policy: &ExitPolicy,
) -> Result<SimulationResult, RebounderError> {
    check_entry_ref(entry_ref)?;
    if path.is_empty() {
        return Err(empty_window());
    }

    let periods = path.len().min(policy.horizon());
    for (i, p) in path[..periods].iter().enumerate() {
        if let Some((reason, exit_return)) = threshold_hit(p.high, p.low, policy) {
            return Ok(finish(entry_ref, i + 1, exit_return, reason));
        }
    }

    let last = path[periods - 1].close;
    Ok(finish(entry_ref, periods, last, ExitReason::HorizonExpiry))
}

/// Outcome of a capital-split replay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SplitOutcome {
    /// Exit measured against the quantity-weighted average entry price.
    pub result: SimulationResult,
    /// Fraction of the per-trade capital actually committed.
    pub invested_fraction: f64,
    /// Period in which the second tranche was bought.
    pub averaged_at: Option<usize>,
}

/// Replay `policy` committing `initial_fraction` of the capital up front and
/// the remainder once, when the cumulative return first reaches the
/// averaging trigger.
///
/// Checks run in the live order: target, stop, horizon, then averaging. A
/// tranche bought in period `t` affects exit checks from period `t + 1`.
pub fn simulate_split(
    entry_ref: f64,
    forward_returns: &[f64],
    policy: &ExitPolicy,
    initial_fraction: f64,
) -> Result<SplitOutcome, RebounderError> {
    check_entry_ref(entry_ref)?;
    if !(initial_fraction > 0.0 && initial_fraction <= 1.0) {
        return Err(RebounderError::InvalidInput {
            reason: format!("initial_fraction must be in (0, 1], got {initial_fraction}"),
        });
    }
    if forward_returns.is_empty() {
        return Err(empty_window());
    }

    let reserve = 1.0 - initial_fraction;
    let periods = forward_returns.len().min(policy.horizon());
    let mut cumulative = 0.0;
    // (period, cumulative return at the second fill)
    let mut averaged: Option<(usize, f64)> = None;

    for (i, r) in forward_returns[..periods].iter().enumerate() {
        cumulative += r;
        let second_fill = averaged.map(|a| a.1);
        let blended = blended_return(cumulative, initial_fraction, second_fill);

        if let Some((reason, exit_return)) = threshold_hit(blended, blended, policy) {
            return Ok(SplitOutcome {
                result: finish(
                    average_entry(entry_ref, initial_fraction, second_fill),
                    i + 1,
                    exit_return,
                    reason,
                ),
                invested_fraction: if averaged.is_some() { 1.0 } else { initial_fraction },
                averaged_at: averaged.map(|a| a.0),
            });
        }
        let last_period = i + 1 == periods;
        if !last_period && averaged.is_none() && reserve > 0.0 && 1.0 + cumulative > 0.0 {
            if let Some(trigger) = policy.averaging_trigger() {
                if cumulative <= trigger {
                    averaged = Some((i + 1, cumulative));
                }
            }
        }
    }

    let second_fill = averaged.map(|a| a.1);
    Ok(SplitOutcome {
        result: finish(
            average_entry(entry_ref, initial_fraction, second_fill),
            periods,
            blended_return(cumulative, initial_fraction, second_fill),
            ExitReason::HorizonExpiry,
        ),
        invested_fraction: if averaged.is_some() { 1.0 } else { initial_fraction },
        averaged_at: averaged.map(|a| a.0),
    })
}

/// Return on invested capital, measured against the weighted entry.
fn blended_return(cumulative: f64, initial_fraction: f64, second_fill: Option<f64>) -> f64 {
    match second_fill {
        None => cumulative,
        Some(at) => {
            let reserve = 1.0 - initial_fraction;
            let value =
                initial_fraction * (1.0 + cumulative) + reserve * (1.0 + cumulative) / (1.0 + at);
            value - 1.0
        }
    }
}

fn average_entry(entry_ref: f64, initial_fraction: f64, second_fill: Option<f64>) -> f64 {
    match second_fill {
        None => entry_ref,
        Some(at) => {
            let reserve = 1.0 - initial_fraction;
            let units = initial_fraction + reserve / (1.0 + at);
            entry_ref / units
        }
    }
}

/// Threshold crossed this period, with the capped exit return.
fn threshold_hit(high: f64, low: f64, policy: &ExitPolicy) -> Option<(ExitReason, f64)> {
    if high >= policy.target_profit() {
        Some((ExitReason::TargetProfit, policy.target_profit()))
    } else if low <= policy.stop_loss() {
        Some((ExitReason::StopLoss, policy.stop_loss()))
    } else {
        None
    }
}

fn finish(entry_ref: f64, period: usize, exit_return: f64, reason: ExitReason) -> SimulationResult {
    SimulationResult {
        exit_period: period,
        exit_return,
        exit_price: entry_ref * (1.0 + exit_return),
        reason,
        success: exit_return > 0.0,
    }
}

fn check_entry_ref(entry_ref: f64) -> Result<(), RebounderError> {
    if entry_ref.is_finite() && entry_ref > 0.0 {
        Ok(())
    } else {
        Err(RebounderError::InvalidInput {
            reason: format!("entry reference must be a positive price, got {entry_ref}"),
        })
    }
}

fn empty_window() -> RebounderError {
    RebounderError::InsufficientHistory {
        what: "forward window".into(),
        have: 0,
        need: 1,
    }
}
