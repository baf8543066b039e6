//! Strategy grid-search calibrator.
//!
//! Offline search for the global exit policy. Every (take-profit, stop-loss)
//! pair of the grid is replayed through the simulator over the accepted
//! analog population and the pairs are ranked by total realized return.
//!
//! Two comparisons hold the exit policy fixed instead:
//! [`compare_allocations`] pits a full first-fill commitment against a split
//! commitment with one averaging buy, and [`compare_capital_levels`] replays
//! the same policy for several account sizes.

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use super::crash_event::CrashEvent;
use super::error::RebounderError;
use super::policy::ExitPolicy;
use super::simulator::{simulate, simulate_split, ExitReason, SimulationResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    pub min_probability: f64,
    pub min_volume: i64,
    pub horizon: usize,
    /// Carried into the calibrated policy when it fires before the stop.
    pub averaging_trigger: Option<f64>,
    pub per_trade_capital: f64,
    pub initial_fraction: f64,
    /// Share of the account committed per trade in the capital-level
    /// comparison.
    pub position_fraction: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            min_probability: 0.6,
            min_volume: 1_000_000,
            horizon: 5,
            averaging_trigger: Some(-0.03),
            per_trade_capital: 1_000_000.0,
            initial_fraction: 0.5,
            position_fraction: 0.10,
        }
    }
}

/// How the input population was filtered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PopulationStats {
    pub total: usize,
    pub accepted: usize,
    pub below_threshold: usize,
    pub illiquid: usize,
    /// Events with no forward window or no usable reference price.
    pub unusable: usize,
}

/// Aggregate outcome of one grid pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridCell {
    pub take_profit: f64,
    pub stop_loss: f64,
    /// Position in the Cartesian product, take-profit major.
    pub grid_index: usize,
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub mean_return: f64,
    pub total_return: f64,
    pub mean_holding: f64,
    pub target_exits: usize,
    pub stop_exits: usize,
    pub horizon_exits: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calibration {
    pub best: ExitPolicy,
    /// Best first.
    pub ranked: Vec<GridCell>,
    pub population: PopulationStats,
}

impl Calibration {
    pub fn best_cell(&self) -> Option<&GridCell> {
        self.ranked.first()
    }
}

/// Split `population` into the events a live trader would have entered.
pub fn accept_population<'a>(
    population: &'a [CrashEvent],
    config: &CalibrationConfig,
) -> (Vec<&'a CrashEvent>, PopulationStats) {
    let mut stats = PopulationStats {
        total: population.len(),
        ..PopulationStats::default()
    };
    let mut accepted = Vec::with_capacity(population.len());
    for event in population {
        if !event.is_accepted(config.min_probability) {
            stats.below_threshold += 1;
        } else if !event.is_liquid(config.min_volume) {
            stats.illiquid += 1;
        } else if event.forward.is_empty() || !(event.close.is_finite() && event.close > 0.0) {
            stats.unusable += 1;
        } else {
            accepted.push(event);
        }
    }
    stats.accepted = accepted.len();
    (accepted, stats)
}

/// Grid-search the global exit policy.
///
/// Grid cells are evaluated in parallel; ranking is total return
/// descending, then win rate descending, then grid order.
pub fn calibrate(
    population: &[CrashEvent],
    take_profit_grid: &[f64],
    stop_loss_grid: &[f64],
    config: &CalibrationConfig,
) -> Result<Calibration, RebounderError> {
    if take_profit_grid.is_empty() || stop_loss_grid.is_empty() {
        return Err(RebounderError::InvalidInput {
            reason: "take-profit and stop-loss grids must both be non-empty".into(),
        });
    }
    let mut cells = Vec::with_capacity(take_profit_grid.len() * stop_loss_grid.len());
    for &tp in take_profit_grid {
        for &sl in stop_loss_grid {
            cells.push(ExitPolicy::new(tp, sl, None, config.horizon)?);
        }
    }

    let (accepted, population_stats) = accept_population(population, config);
    if accepted.is_empty() {
        return Err(RebounderError::InsufficientHistory {
            what: "calibration population".into(),
            have: 0,
            need: 1,
        });
    }
    info!(
        total = population_stats.total,
        accepted = population_stats.accepted,
        cells = cells.len(),
        "calibrating exit policy"
    );

    let returns: Vec<(f64, Vec<f64>)> = accepted
        .iter()
        .map(|e| (e.close, e.forward_returns()))
        .collect();

    let evaluated: Result<Vec<GridCell>, RebounderError> = cells
        .par_iter()
        .enumerate()
        .map(|(index, policy)| evaluate_cell(index, policy, &returns))
        .collect();
    let mut ranked = evaluated?;

    ranked.sort_by(|a, b| {
        b.total_return
            .total_cmp(&a.total_return)
            .then(b.win_rate.total_cmp(&a.win_rate))
            .then(a.grid_index.cmp(&b.grid_index))
    });

    let top = &ranked[0];
    let best = ExitPolicy::new(top.take_profit, top.stop_loss, None, config.horizon)?
        .with_averaging_if_valid(config.averaging_trigger);
    info!(%best, total_return = top.total_return, win_rate = top.win_rate, "calibrated");

    Ok(Calibration {
        best,
        ranked,
        population: population_stats,
    })
}

fn evaluate_cell(
    grid_index: usize,
    policy: &ExitPolicy,
    population: &[(f64, Vec<f64>)],
) -> Result<GridCell, RebounderError> {
    let mut cell = GridCell {
        take_profit: policy.target_profit(),
        stop_loss: policy.stop_loss(),
        grid_index,
        trades: 0,
        wins: 0,
        win_rate: 0.0,
        mean_return: 0.0,
        total_return: 0.0,
        mean_holding: 0.0,
        target_exits: 0,
        stop_exits: 0,
        horizon_exits: 0,
    };
    let mut holding = 0usize;
    for (close, returns) in population {
        let result = simulate(*close, returns, policy)?;
        cell.trades += 1;
        cell.total_return += result.exit_return;
        holding += result.exit_period;
        if result.success {
            cell.wins += 1;
        }
        match result.reason {
            ExitReason::TargetProfit => cell.target_exits += 1,
            ExitReason::StopLoss => cell.stop_exits += 1,
            ExitReason::HorizonExpiry => cell.horizon_exits += 1,
        }
    }
    if cell.trades > 0 {
        let n = cell.trades as f64;
        cell.win_rate = cell.wins as f64 / n;
        cell.mean_return = cell.total_return / n;
        cell.mean_holding = holding as f64 / n;
    }
    debug!(
        take_profit = cell.take_profit,
        stop_loss = cell.stop_loss,
        total_return = cell.total_return,
        win_rate = cell.win_rate,
        "grid cell"
    );
    Ok(cell)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    FullCommit,
    SplitAveraging,
}

impl std::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationStrategy::FullCommit => write!(f, "full commit"),
            AllocationStrategy::SplitAveraging => write!(f, "split with averaging"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationStats {
    pub strategy: AllocationStrategy,
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub total_profit: f64,
    /// Capital actually put to work across all trades.
    pub invested: f64,
    /// Total profit over the capital budgeted (`trades × per-trade capital`).
    pub return_rate: f64,
    pub averaging_count: usize,
}

impl AllocationStats {
    fn new(strategy: AllocationStrategy) -> Self {
        AllocationStats {
            strategy,
            trades: 0,
            wins: 0,
            win_rate: 0.0,
            total_profit: 0.0,
            invested: 0.0,
            return_rate: 0.0,
            averaging_count: 0,
        }
    }

    fn record(&mut self, invested: f64, result: &SimulationResult) {
        self.trades += 1;
        self.invested += invested;
        self.total_profit += invested * result.exit_return;
        if result.success {
            self.wins += 1;
        }
    }

    fn finish(&mut self, per_trade_capital: f64) {
        if self.trades > 0 {
            self.win_rate = self.wins as f64 / self.trades as f64;
            self.return_rate = self.total_profit / (self.trades as f64 * per_trade_capital);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationComparison {
    pub full_commit: AllocationStats,
    pub split_averaging: AllocationStats,
    pub recommendation: AllocationStrategy,
}

/// Compare committing all per-trade capital up front against committing
/// `initial_fraction` and averaging once with the rest.
///
/// Both strategies see the same events and thresholds. The liquidity check
/// uses the full per-trade capital for both.
pub fn compare_allocations(
    population: &[CrashEvent],
    policy: &ExitPolicy,
    config: &CalibrationConfig,
) -> Result<AllocationComparison, RebounderError> {
    check_positive("per-trade capital", config.per_trade_capital)?;
    let (accepted, _) = accept_population(population, config);
    let eligible: Vec<&CrashEvent> = accepted
        .into_iter()
        .filter(|e| fits_liquidity(e, config.per_trade_capital))
        .collect();
    if eligible.is_empty() {
        return Err(RebounderError::InsufficientHistory {
            what: "allocation comparison population".into(),
            have: 0,
            need: 1,
        });
    }

    let full_policy = policy.without_averaging();
    let split_policy =
        policy.with_averaging_if_valid(config.averaging_trigger.or(policy.averaging_trigger()));
    let capital = config.per_trade_capital;

    let mut full = AllocationStats::new(AllocationStrategy::FullCommit);
    let mut split = AllocationStats::new(AllocationStrategy::SplitAveraging);
    for event in &eligible {
        let returns = event.forward_returns();

        let result = simulate(event.close, &returns, &full_policy)?;
        full.record(capital, &result);

        let outcome = simulate_split(event.close, &returns, &split_policy, config.initial_fraction)?;
        split.record(capital * outcome.invested_fraction, &outcome.result);
        if outcome.averaged_at.is_some() {
            split.averaging_count += 1;
        }
    }
    full.finish(capital);
    split.finish(capital);

    let recommendation = if full.total_profit > split.total_profit {
        AllocationStrategy::FullCommit
    } else {
        AllocationStrategy::SplitAveraging
    };
    info!(
        full_profit = full.total_profit,
        split_profit = split.total_profit,
        %recommendation,
        "allocation comparison"
    );
    Ok(AllocationComparison {
        full_commit: full,
        split_averaging: split,
        recommendation,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapitalLevelResult {
    pub account_size: f64,
    pub per_trade_capital: f64,
    pub trades: usize,
    /// Accepted events too thin to absorb this per-trade size.
    pub illiquid: usize,
    pub wins: usize,
    pub total_profit: f64,
    /// Total profit over the account size.
    pub return_rate: f64,
}

/// Replay a fixed policy (full commitment) for several account sizes.
pub fn compare_capital_levels(
    population: &[CrashEvent],
    policy: &ExitPolicy,
    levels: &[f64],
    config: &CalibrationConfig,
) -> Result<Vec<CapitalLevelResult>, RebounderError> {
    if levels.is_empty() {
        return Err(RebounderError::InvalidInput {
            reason: "at least one capital level is required".into(),
        });
    }
    for &level in levels {
        check_positive("capital level", level)?;
    }
    if !(config.position_fraction > 0.0 && config.position_fraction <= 1.0) {
        return Err(RebounderError::InvalidInput {
            reason: format!(
                "position fraction must be in (0, 1], got {}",
                config.position_fraction
            ),
        });
    }

    let (accepted, _) = accept_population(population, config);
    let policy = policy.without_averaging();
    levels
        .par_iter()
        .map(|&account_size| {
            let per_trade = account_size * config.position_fraction;
            let mut level = CapitalLevelResult {
                account_size,
                per_trade_capital: per_trade,
                trades: 0,
                illiquid: 0,
                wins: 0,
                total_profit: 0.0,
                return_rate: 0.0,
            };
            for event in &accepted {
                if !fits_liquidity(event, per_trade) {
                    level.illiquid += 1;
                    continue;
                }
                let result = simulate(event.close, &event.forward_returns(), &policy)?;
                level.trades += 1;
                level.total_profit += per_trade * result.exit_return;
                if result.success {
                    level.wins += 1;
                }
            }
            level.return_rate = level.total_profit / account_size;
            Ok(level)
        })
        .collect()
}

/// Enough traded volume to absorb `capital` worth of units.
fn fits_liquidity(event: &CrashEvent, capital: f64) -> bool {
    event.volume as f64 >= capital / event.close
}

fn check_positive(what: &str, value: f64) -> Result<(), RebounderError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(RebounderError::InvalidInput {
            reason: format!("{what} must be positive, got {value}"),
        })
    }
}
