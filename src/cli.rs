//! CLI definition and dispatch.

use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::log_notifier::LogNotifier;
use crate::adapters::markdown_report::{render_trade_summary, MarkdownReportAdapter};
use crate::adapters::paper_execution::PaperExecution;
use crate::adapters::sqlite_adapter::SqliteAdapter;
use crate::domain::calibrator::{
    calibrate, compare_allocations, compare_capital_levels, CalibrationConfig,
};
use crate::domain::config_validation::{double_list, policy_override, validate_all};
use crate::domain::crash_event::CrashEvent;
use crate::domain::error::RebounderError;
use crate::domain::manager::{Evaluation, ManagerConfig, PositionManager, Reconciled, Resolution, ScanReport};
use crate::domain::optimizer::{ExitPolicyOptimizer, OptimizedPolicy, OptimizerConfig, PolicyOrigin};
use crate::domain::policy::{ExitPolicy, DEFAULT_POLICY};
use crate::domain::position::{Position, PositionId};
use crate::domain::simulator::{simulate, simulate_split};
use crate::domain::summary::TradeSummary;
use crate::ports::config_port::ConfigPort;
use crate::ports::execution_port::ExecutionPort;
use crate::ports::history_port::HistoryPort;
use crate::ports::report_port::{CalibrationReport, ReportPort};
use crate::ports::state_port::StatePort;
use crate::self_test;

pub const DEFAULT_TAKE_PROFIT_GRID: [f64; 6] = [0.03, 0.05, 0.07, 0.10, 0.15, 0.20];
pub const DEFAULT_STOP_LOSS_GRID: [f64; 5] = [-0.02, -0.03, -0.05, -0.07, -0.10];
pub const DEFAULT_CAPITAL_LEVELS: [f64; 4] =
    [10_000_000.0, 50_000_000.0, 100_000_000.0, 500_000_000.0];
const DEFAULT_SCAN_INTERVAL_SECS: i64 = 60;

#[derive(Parser, Debug)]
#[command(
    name = "rebounder",
    about = "Crash-rebound exit-policy optimizer and position manager"
)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Import crash events from CSV into the history database
    Import {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        csv: PathBuf,
    },
    /// Grid-search the global exit policy over historical crash events
    Calibrate {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Write a Markdown report here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Do not persist the selected policy
        #[arg(long)]
        no_save: bool,
    },
    /// Derive per-instrument exit policies from each instrument's history
    Optimize {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        instrument: Option<String>,
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Replay one forward window through an exit policy
    Simulate {
        /// Comma-separated period returns, e.g. 0.03,0.04,0.05
        #[arg(long, allow_hyphen_values = true)]
        returns: String,
        #[arg(long, default_value_t = 100.0)]
        entry: f64,
        #[arg(long, default_value_t = DEFAULT_POLICY.target_profit())]
        target: f64,
        #[arg(long, allow_negative_numbers = true, default_value_t = DEFAULT_POLICY.stop_loss())]
        stop: f64,
        #[arg(long, default_value_t = DEFAULT_POLICY.horizon())]
        horizon: usize,
        /// Averaging trigger; replays a split commitment when set
        #[arg(long, allow_negative_numbers = true)]
        averaging: Option<f64>,
        #[arg(long, default_value_t = 0.5)]
        initial_fraction: f64,
    },
    /// Replay history through the live manager and compare with simulation
    SelfTest {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Show open positions and realized trade statistics
    Positions {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Scan open positions periodically against paper execution
    Watch {
        #[arg(short, long)]
        config: PathBuf,
        /// CSV of `instrument,price`, re-read before every scan
        #[arg(long)]
        prices: Option<PathBuf>,
        /// Open positions for the crash events of this date first
        #[arg(long)]
        enter: Option<NaiveDate>,
        #[arg(long, default_value_t = 1)]
        ticks: u32,
        /// Seconds between scans; defaults to [manager] scan_interval_secs
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Record the real outcome of an order whose fill timed out
    Reconcile {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: PositionId,
        /// Filled quantity; omit with --price for an order that never filled
        #[arg(long, requires = "price")]
        quantity: Option<i64>,
        #[arg(long, requires = "quantity")]
        price: Option<f64>,
    },
}

/// Where the global policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySource {
    Calibrated,
    Config,
    Default,
}

impl fmt::Display for PolicySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicySource::Calibrated => write!(f, "calibrated"),
            PolicySource::Config => write!(f, "[policy] section"),
            PolicySource::Default => write!(f, "default"),
        }
    }
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Validate { config } => run_validate(&config),
        Command::Import { config, csv } => run_import(&config, &csv),
        Command::Calibrate {
            config,
            from,
            to,
            output,
            no_save,
        } => run_calibrate(&config, from, to, output.as_deref(), no_save),
        Command::Optimize {
            config,
            instrument,
            as_of,
        } => run_optimize(&config, instrument.as_deref(), as_of),
        Command::Simulate {
            returns,
            entry,
            target,
            stop,
            horizon,
            averaging,
            initial_fraction,
        } => run_simulate(
            &returns,
            entry,
            target,
            stop,
            horizon,
            averaging,
            initial_fraction,
        ),
        Command::SelfTest { config, from, to } => run_self_test(&config, from, to),
        Command::Positions { config } => run_positions(&config),
        Command::Watch {
            config,
            prices,
            enter,
            ticks,
            interval,
        } => run_watch(&config, prices.as_deref(), enter, ticks, interval),
        Command::Reconcile {
            config,
            id,
            quantity,
            price,
        } => run_reconcile(&config, id, quantity, price),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(&e)
        }
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<FileConfigAdapter, RebounderError> {
    let config = FileConfigAdapter::from_file(path)?;
    validate_all(&config)?;
    Ok(config)
}

pub fn build_manager_config(config: &dyn ConfigPort) -> ManagerConfig {
    let d = ManagerConfig::default();
    let timeout_ms = config.get_int(
        "execution",
        "fill_timeout_ms",
        d.fill_timeout.as_millis() as i64,
    );
    ManagerConfig {
        total_capital: config.get_double("capital", "total_capital", d.total_capital),
        per_trade_cap: config.get_double("capital", "per_trade_cap", d.per_trade_cap),
        max_positions: config
            .get_int("capital", "max_positions", d.max_positions as i64)
            .max(0) as usize,
        initial_fraction: config.get_double("capital", "initial_fraction", d.initial_fraction),
        min_probability: config.get_double("entry", "min_probability", d.min_probability),
        fill_timeout: Duration::from_millis(timeout_ms.max(1) as u64),
    }
}

pub fn build_calibration_config(
    config: &dyn ConfigPort,
) -> Result<CalibrationConfig, RebounderError> {
    let d = CalibrationConfig::default();
    let averaging_trigger = match config.get_string("calibration", "averaging_trigger") {
        Some(raw) if raw.trim().eq_ignore_ascii_case("none") => None,
        Some(raw) => Some(raw.trim().parse::<f64>().map_err(|_| {
            RebounderError::ConfigInvalid {
                section: "calibration".into(),
                key: "averaging_trigger".into(),
                reason: format!("'{raw}' is not a number or 'none'"),
            }
        })?),
        None => d.averaging_trigger,
    };
    let horizon = config.get_int("calibration", "horizon", d.horizon as i64);
    if horizon < 1 {
        return Err(RebounderError::ConfigInvalid {
            section: "calibration".into(),
            key: "horizon".into(),
            reason: "horizon must be at least 1".into(),
        });
    }
    Ok(CalibrationConfig {
        min_probability: config.get_double("entry", "min_probability", d.min_probability),
        min_volume: config.get_int("entry", "min_volume", d.min_volume),
        horizon: horizon as usize,
        averaging_trigger,
        per_trade_capital: config.get_double(
            "calibration",
            "per_trade_capital",
            d.per_trade_capital,
        ),
        initial_fraction: config.get_double(
            "calibration",
            "initial_fraction",
            d.initial_fraction,
        ),
        position_fraction: config.get_double(
            "calibration",
            "position_fraction",
            d.position_fraction,
        ),
    })
}

pub fn build_optimizer_config(config: &dyn ConfigPort) -> OptimizerConfig {
    let d = OptimizerConfig::default();
    OptimizerConfig {
        min_samples: config
            .get_int("optimizer", "min_samples", d.min_samples as i64)
            .max(0) as usize,
        window: config.get_int("optimizer", "window", d.window as i64).max(0) as usize,
        target_percentile: config.get_double("optimizer", "target_percentile", d.target_percentile),
        target_min: config.get_double("optimizer", "target_min", d.target_min),
        target_max: config.get_double("optimizer", "target_max", d.target_max),
        stop_loss: config.get_double("optimizer", "stop_loss", d.stop_loss),
        averaging_min: config.get_double("optimizer", "averaging_min", d.averaging_min),
        averaging_max: config.get_double("optimizer", "averaging_max", d.averaging_max),
        lookback_days: config.get_int("optimizer", "lookback_days", d.lookback_days),
    }
}

/// Global policy: the persisted calibration result, else the `[policy]`
/// section, else the built-in default.
pub fn resolve_global_policy(
    config: &dyn ConfigPort,
    state: &dyn StatePort,
) -> Result<(ExitPolicy, PolicySource), RebounderError> {
    if let Some(policy) = state.load_global_policy()? {
        return Ok((policy, PolicySource::Calibrated));
    }
    if let Some(policy) = policy_override(config)? {
        return Ok((policy, PolicySource::Config));
    }
    Ok((DEFAULT_POLICY, PolicySource::Default))
}

/// Comma-separated returns as fractions.
pub fn parse_returns(raw: &str) -> Result<Vec<f64>, RebounderError> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>().map_err(|_| RebounderError::InvalidInput {
                reason: format!("'{s}' is not a return"),
            })
        })
        .collect()
}

fn history_range(
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<(NaiveDate, NaiveDate), RebounderError> {
    let from = from
        .or_else(|| NaiveDate::from_ymd_opt(1900, 1, 1))
        .unwrap_or(NaiveDate::MIN);
    let to = to.unwrap_or_else(|| Local::now().date_naive());
    if from > to {
        return Err(RebounderError::InvalidInput {
            reason: format!("--from {from} is after --to {to}"),
        });
    }
    Ok((from, to))
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn run_validate(config_path: &Path) -> Result<(), RebounderError> {
    eprintln!("Loading config from {}", config_path.display());
    let config = load_config(config_path)?;
    let manager = build_manager_config(&config);
    let calibration = build_calibration_config(&config)?;
    let optimizer = build_optimizer_config(&config);
    optimizer.validate()?;

    println!("Config validated successfully");
    println!(
        "  Capital:      {:.0} total, {:.0} per trade, {} positions max",
        manager.total_capital, manager.per_trade_cap, manager.max_positions
    );
    println!(
        "  Entry:        probability >= {:.2}, volume >= {}",
        calibration.min_probability, calibration.min_volume
    );
    match policy_override(&config)? {
        Some(policy) => println!("  Policy:       {policy} ([policy] section)"),
        None => println!("  Policy:       {DEFAULT_POLICY} (default)"),
    }
    println!(
        "  Optimizer:    {} periods, target band {:.1}%..{:.1}%",
        optimizer.window,
        optimizer.target_min * 100.0,
        optimizer.target_max * 100.0
    );
    println!(
        "  Fill timeout: {}ms",
        manager.fill_timeout.as_millis()
    );
    Ok(())
}

fn run_import(config_path: &Path, csv_path: &Path) -> Result<(), RebounderError> {
    let config = load_config(config_path)?;
    let db = SqliteAdapter::from_config(&config)?;
    eprintln!("Reading crash events from {}", csv_path.display());
    let events = CrashEvent::dedup(CsvAdapter::new(csv_path).load()?);
    let written = db.insert_events(&events)?;
    println!(
        "Imported {written} crash events; {} in history",
        db.event_count()?
    );
    Ok(())
}

fn run_calibrate(
    config_path: &Path,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    output: Option<&Path>,
    no_save: bool,
) -> Result<(), RebounderError> {
    let config = load_config(config_path)?;
    let db = SqliteAdapter::from_config(&config)?;
    let (from, to) = history_range(from, to)?;
    let calibration_config = build_calibration_config(&config)?;
    let take_profit_grid = double_list(&config, "calibration", "take_profit_grid")?
        .unwrap_or_else(|| DEFAULT_TAKE_PROFIT_GRID.to_vec());
    let stop_loss_grid = double_list(&config, "calibration", "stop_loss_grid")?
        .unwrap_or_else(|| DEFAULT_STOP_LOSS_GRID.to_vec());
    let levels = double_list(&config, "calibration", "capital_levels")?
        .unwrap_or_else(|| DEFAULT_CAPITAL_LEVELS.to_vec());

    let events = db.crash_events_between(from, to)?;
    eprintln!(
        "Calibrating over {} crash events ({from} to {to}), {} grid cells",
        events.len(),
        take_profit_grid.len() * stop_loss_grid.len()
    );
    let calibration = calibrate(
        &events,
        &take_profit_grid,
        &stop_loss_grid,
        &calibration_config,
    )?;
    let allocation = match compare_allocations(&events, &calibration.best, &calibration_config) {
        Ok(comparison) => Some(comparison),
        Err(RebounderError::InsufficientHistory { what, .. }) => {
            eprintln!("warning: skipping allocation comparison (no events for {what})");
            None
        }
        Err(e) => return Err(e),
    };
    let capital_levels =
        compare_capital_levels(&events, &calibration.best, &levels, &calibration_config)?;

    let population = &calibration.population;
    println!("\n=== Calibration ===");
    println!(
        "Population:       {} events, {} accepted ({} below threshold, {} illiquid, {} unusable)",
        population.total,
        population.accepted,
        population.below_threshold,
        population.illiquid,
        population.unusable
    );
    println!("Selected policy:  {}", calibration.best);
    if let Some(cell) = calibration.best_cell() {
        println!("Trades:           {}", cell.trades);
        println!("Win Rate:         {:.1}%", cell.win_rate * 100.0);
        println!("Mean Return:      {:.2}%", cell.mean_return * 100.0);
        println!("Total Return:     {:.2}%", cell.total_return * 100.0);
        println!("Mean Holding:     {:.1} periods", cell.mean_holding);
    }
    if let Some(comparison) = &allocation {
        println!("\n=== Allocation ===");
        for stats in [&comparison.full_commit, &comparison.split_averaging] {
            println!(
                "  {}:  {} trades, {:.1}% win rate, profit {:.0}, return {:.2}%",
                stats.strategy,
                stats.trades,
                stats.win_rate * 100.0,
                stats.total_profit,
                stats.return_rate * 100.0
            );
        }
        println!("  Recommended: {}", comparison.recommendation);
    }
    println!("\n=== Capital Levels ===");
    for level in &capital_levels {
        println!(
            "  {:>14.0}:  {} trades ({} illiquid), profit {:.0}, return {:.2}%",
            level.account_size,
            level.trades,
            level.illiquid,
            level.total_profit,
            level.return_rate * 100.0
        );
    }

    if let Some(output) = output {
        let report = CalibrationReport {
            generated: Local::now().date_naive(),
            period: (from, to),
            calibration: &calibration,
            allocation: allocation.as_ref(),
            capital_levels: &capital_levels,
        };
        MarkdownReportAdapter::new().write(&report, &output.display().to_string())?;
        eprintln!("\nReport written to: {}", output.display());
    }
    if no_save {
        eprintln!("Policy not saved (--no-save)");
    } else {
        db.save_global_policy(&calibration.best)?;
        eprintln!("Saved global policy: {}", calibration.best);
    }
    Ok(())
}

fn origin_label(optimized: &OptimizedPolicy) -> String {
    match optimized.origin {
        PolicyOrigin::Personalized => "personalized".to_string(),
        PolicyOrigin::Fallback(reason) => format!("global ({reason:?})"),
    }
}

fn run_optimize(
    config_path: &Path,
    instrument: Option<&str>,
    as_of: Option<NaiveDate>,
) -> Result<(), RebounderError> {
    let config = load_config(config_path)?;
    let db = SqliteAdapter::from_config(&config)?;
    let optimizer_config = build_optimizer_config(&config);
    optimizer_config.validate()?;
    let (global, source) = resolve_global_policy(&config, &db)?;
    eprintln!("Global policy ({source}): {global}");

    let as_of = as_of.unwrap_or_else(|| Local::now().date_naive());
    let optimizer = ExitPolicyOptimizer::new(optimizer_config, global);
    let policies = match instrument {
        Some(instrument) => vec![optimizer.optimize(&db, instrument, as_of)],
        None => optimizer.optimize_all(&db, as_of)?,
    };
    if policies.is_empty() {
        eprintln!("warning: no instruments in crash history");
    }
    for optimized in &policies {
        println!(
            "{:<12} {:<52} {:>3} samples  {}",
            optimized.instrument,
            optimized.policy.to_string(),
            optimized.samples,
            origin_label(optimized)
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_simulate(
    returns: &str,
    entry: f64,
    target: f64,
    stop: f64,
    horizon: usize,
    averaging: Option<f64>,
    initial_fraction: f64,
) -> Result<(), RebounderError> {
    let returns = parse_returns(returns)?;
    let policy = ExitPolicy::new(target, stop, averaging, horizon)?;
    println!("Policy: {policy}");
    let (result, averaged_at) = if averaging.is_some() {
        let outcome = simulate_split(entry, &returns, &policy, initial_fraction)?;
        (outcome.result, outcome.averaged_at)
    } else {
        (simulate(entry, &returns, &policy)?, None)
    };
    println!("Exit:   {} at period {}", result.reason, result.exit_period);
    println!(
        "Return: {:.2}% (price {:.4})",
        result.exit_return * 100.0,
        result.exit_price
    );
    if let Some(period) = averaged_at {
        println!("Averaged at period {period}");
    }
    Ok(())
}

fn run_self_test(
    config_path: &Path,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<(), RebounderError> {
    let config = load_config(config_path)?;
    let db = SqliteAdapter::from_config(&config)?;
    let (from, to) = history_range(from, to)?;
    let (policy, source) = resolve_global_policy(&config, &db)?;
    let calibration_config = build_calibration_config(&config)?;
    let fill_timeout = build_manager_config(&config).fill_timeout;

    let events = db.crash_events_between(from, to)?;
    eprintln!(
        "Replaying {} crash events under {policy} ({source})",
        events.len()
    );
    let report = self_test::run(&events, &policy, &calibration_config, fill_timeout)?;
    println!(
        "Replayed {}, matched {}, {} with short windows",
        report.replayed, report.matched, report.incomplete
    );
    for m in &report.mismatches {
        let actual = match m.actual {
            Some(exit) => format!("{} at period {}", exit.reason, exit.period),
            None => "no exit".to_string(),
        };
        println!(
            "  MISMATCH {} {}: expected {} at period {}, got {}{}",
            m.instrument,
            m.date,
            m.expected.reason,
            m.expected.period,
            actual,
            m.detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default()
        );
    }
    if report.passed() {
        println!("Self-test passed");
        Ok(())
    } else {
        Err(RebounderError::invariant(format!(
            "{} of {} replays diverged from simulation",
            report.mismatches.len(),
            report.replayed
        )))
    }
}

fn print_positions(positions: &[Position]) {
    if positions.is_empty() {
        println!("No open positions");
        return;
    }
    println!(
        "{:>4}  {:<10} {:<13} {:>10} {:>12} {:>14}  {:<19}  {}",
        "id", "instrument", "state", "quantity", "entry", "committed", "entered", "policy"
    );
    for p in positions {
        let flag = if p.needs_reconciliation() {
            "  [needs reconciliation]"
        } else {
            ""
        };
        println!(
            "{:>4}  {:<10} {:<13} {:>10} {:>12.2} {:>14.0}  {:<19}  {}{}",
            p.id,
            p.instrument,
            p.state().to_string(),
            p.quantity,
            p.entry_price,
            p.committed,
            p.entry_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            p.policy,
            flag
        );
    }
}

fn run_positions(config_path: &Path) -> Result<(), RebounderError> {
    let config = load_config(config_path)?;
    let db = SqliteAdapter::from_config(&config)?;
    let positions = db.load_positions()?;
    let trades = db.load_trades()?;
    let total_capital = build_manager_config(&config).total_capital;

    println!("=== Open Positions ===");
    print_positions(&positions);
    println!("\n=== Realized Trades ===");
    print!("{}", render_trade_summary(&TradeSummary::compute(&trades, total_capital)));
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    instrument: String,
    price: f64,
}

/// Load `instrument,price` rows into the paper book.
pub fn load_prices(path: &Path, paper: &PaperExecution) -> Result<usize, RebounderError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| RebounderError::InvalidInput {
        reason: format!("{}: {e}", path.display()),
    })?;
    let mut count = 0;
    for row in reader.deserialize::<PriceRow>() {
        let row = row.map_err(|e| RebounderError::InvalidInput {
            reason: format!("{}: {e}", path.display()),
        })?;
        if !(row.price.is_finite() && row.price > 0.0) {
            return Err(RebounderError::InvalidInput {
                reason: format!("price for {} must be positive, got {}", row.instrument, row.price),
            });
        }
        paper.set_price(&row.instrument, row.price);
        count += 1;
    }
    Ok(count)
}

/// Open positions for the crash events dated `date`, each under its
/// instrument's optimized policy.
fn enter_events(
    config: &dyn ConfigPort,
    manager: &PositionManager,
    db: &SqliteAdapter,
    paper: &PaperExecution,
    date: NaiveDate,
) -> Result<usize, RebounderError> {
    let (global, source) = resolve_global_policy(config, db)?;
    let optimizer = ExitPolicyOptimizer::new(build_optimizer_config(config), global);
    let events = db.crash_events_between(date, date)?;
    eprintln!(
        "{} crash events on {date}; global policy ({source}): {global}",
        events.len()
    );
    let mut opened = 0;
    for event in &events {
        // entries are sized and filled at the event's reference close
        paper.set_price(&event.instrument, event.close);
        let optimized = optimizer.optimize(db, &event.instrument, date);
        match manager.open(event, &optimized.policy, now()) {
            Ok(position) => {
                opened += 1;
                println!(
                    "Entered {} #{}: {} @ {:.2} ({})",
                    position.instrument,
                    position.id,
                    position.quantity,
                    position.entry_price,
                    origin_label(&optimized)
                );
            }
            Err(e) => println!("Skipped {}: {e}", event.instrument),
        }
    }
    Ok(opened)
}

fn print_scan(tick: u32, report: &ScanReport) {
    println!(
        "Scan {tick}: {} evaluated, {} skipped, {} unpriced, {} failed",
        report.evaluated.len(),
        report.skipped.len(),
        report.unpriced.len(),
        report.failed.len()
    );
    for (id, evaluation) in &report.evaluated {
        match evaluation {
            Evaluation::Hold => {}
            Evaluation::Averaged(position) => println!(
                "  #{id} {} averaged, entry now {:.2}",
                position.instrument, position.entry_price
            ),
            Evaluation::Closed(trade) => println!(
                "  #{id} {} closed ({}) at {:.2}, P&L {:.0}",
                trade.instrument, trade.reason, trade.exit_price, trade.pnl
            ),
        }
    }
    for (id, err) in &report.failed {
        println!("  #{id} failed: {err}");
    }
}

fn run_watch(
    config_path: &Path,
    prices: Option<&Path>,
    enter: Option<NaiveDate>,
    ticks: u32,
    interval: Option<u64>,
) -> Result<(), RebounderError> {
    let config = load_config(config_path)?;
    let db = Arc::new(SqliteAdapter::from_config(&config)?);
    let paper = Arc::new(PaperExecution::new());
    let execution: Arc<dyn ExecutionPort> = paper.clone();
    let state: Arc<dyn StatePort> = db.clone();
    let manager = PositionManager::new(build_manager_config(&config), execution, state)?
        .with_notifier(Arc::new(LogNotifier));
    let restored = manager.restore()?;
    eprintln!("Restored {restored} open positions");

    if let Some(path) = prices {
        load_prices(path, &paper)?;
    }
    if let Some(date) = enter {
        enter_events(&config, &manager, &db, &paper, date)?;
    }

    let interval = Duration::from_secs(interval.unwrap_or_else(|| {
        config
            .get_int("manager", "scan_interval_secs", DEFAULT_SCAN_INTERVAL_SECS)
            .max(1) as u64
    }));
    for tick in 1..=ticks {
        if let Some(path) = prices {
            load_prices(path, &paper)?;
        }
        let report = manager.scan(now());
        print_scan(tick, &report);
        if tick < ticks {
            thread::sleep(interval);
        }
    }

    manager.check_invariants()?;
    let ledger = manager.ledger();
    println!(
        "\nCommitted {:.0} of {:.0}; {} of {} slots in use; realized P&L {:.0}",
        ledger.committed(),
        ledger.total_capital(),
        ledger.open_positions(),
        ledger.max_positions(),
        ledger.realized_pnl()
    );
    print_positions(&manager.open_positions());
    Ok(())
}

fn run_reconcile(
    config_path: &Path,
    id: PositionId,
    quantity: Option<i64>,
    price: Option<f64>,
) -> Result<(), RebounderError> {
    let config = load_config(config_path)?;
    let db: Arc<dyn StatePort> = Arc::new(SqliteAdapter::from_config(&config)?);
    let execution: Arc<dyn ExecutionPort> = Arc::new(PaperExecution::new());
    let manager = PositionManager::new(build_manager_config(&config), execution, db)?;
    manager.restore()?;

    let resolution = match (quantity, price) {
        (Some(quantity), Some(avg_price)) => Resolution::Filled {
            quantity,
            avg_price,
        },
        _ => Resolution::NotFilled,
    };
    match manager.reconcile(id, resolution, now())? {
        Reconciled::Open(position) => println!(
            "Position #{id} {} is {} with {} @ {:.2}",
            position.instrument,
            position.state(),
            position.quantity,
            position.entry_price
        ),
        Reconciled::Closed(trade) => println!(
            "Position #{id} {} closed ({}), P&L {:.0}",
            trade.instrument, trade.reason, trade.pnl
        ),
        Reconciled::Abandoned => println!("Position #{id} abandoned; reservation released"),
    }
    Ok(())
}
