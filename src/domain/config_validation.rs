//! Configuration validation.
//!
//! Validates every config section before a command runs. Absent keys fall
//! back to the same defaults the commands use, so an empty file is valid.

use crate::domain::calibrator::CalibrationConfig;
use crate::domain::error::RebounderError;
use crate::domain::manager::ManagerConfig;
use crate::domain::optimizer::OptimizerConfig;
use crate::domain::policy::{ExitPolicy, DEFAULT_POLICY};
use crate::ports::config_port::ConfigPort;

pub fn validate_all(config: &dyn ConfigPort) -> Result<(), RebounderError> {
    validate_capital_config(config)?;
    validate_entry_config(config)?;
    validate_policy_override(config)?;
    validate_optimizer_config(config)?;
    validate_calibration_config(config)?;
    validate_runtime_config(config)?;
    Ok(())
}

pub fn validate_capital_config(config: &dyn ConfigPort) -> Result<(), RebounderError> {
    let defaults = ManagerConfig::default();
    let total = config.get_double("capital", "total_capital", defaults.total_capital);
    if total <= 0.0 {
        return Err(invalid("capital", "total_capital", "total_capital must be positive"));
    }
    let per_trade = config.get_double("capital", "per_trade_cap", defaults.per_trade_cap);
    if per_trade <= 0.0 {
        return Err(invalid("capital", "per_trade_cap", "per_trade_cap must be positive"));
    }
    if per_trade > total {
        return Err(invalid(
            "capital",
            "per_trade_cap",
            "per_trade_cap cannot exceed total_capital",
        ));
    }
    let max_positions = config.get_int("capital", "max_positions", defaults.max_positions as i64);
    if max_positions < 1 {
        return Err(invalid("capital", "max_positions", "max_positions must be at least 1"));
    }
    check_fraction(
        config,
        "capital",
        "initial_fraction",
        defaults.initial_fraction,
    )
}

pub fn validate_entry_config(config: &dyn ConfigPort) -> Result<(), RebounderError> {
    let defaults = CalibrationConfig::default();
    let probability = config.get_double("entry", "min_probability", defaults.min_probability);
    if !(0.0..=1.0).contains(&probability) {
        return Err(invalid(
            "entry",
            "min_probability",
            "min_probability must be between 0 and 1",
        ));
    }
    if config.get_int("entry", "min_volume", defaults.min_volume) < 0 {
        return Err(invalid("entry", "min_volume", "min_volume must be non-negative"));
    }
    Ok(())
}

/// A `[policy]` section, when present, must form a valid exit policy.
pub fn validate_policy_override(config: &dyn ConfigPort) -> Result<(), RebounderError> {
    policy_override(config).map(|_| ())
}

/// The `[policy]` section as an exit policy, or `None` if the section sets
/// nothing.
pub fn policy_override(config: &dyn ConfigPort) -> Result<Option<ExitPolicy>, RebounderError> {
    let keys = ["target_profit", "stop_loss", "averaging_trigger", "horizon"];
    if keys.iter().all(|k| config.get_string("policy", k).is_none()) {
        return Ok(None);
    }
    let target = config.get_double("policy", "target_profit", DEFAULT_POLICY.target_profit());
    let stop = config.get_double("policy", "stop_loss", DEFAULT_POLICY.stop_loss());
    let averaging = match config.get_string("policy", "averaging_trigger") {
        None => DEFAULT_POLICY.averaging_trigger(),
        Some(raw) if raw.trim().eq_ignore_ascii_case("none") => None,
        Some(raw) => Some(raw.trim().parse::<f64>().map_err(|_| {
            invalid("policy", "averaging_trigger", "averaging_trigger must be a number or 'none'")
        })?),
    };
    let horizon = config.get_int("policy", "horizon", DEFAULT_POLICY.horizon() as i64);
    if horizon < 1 {
        return Err(invalid("policy", "horizon", "horizon must be at least 1"));
    }
    ExitPolicy::new(target, stop, averaging, horizon as usize)
        .map(Some)
        .map_err(|e| invalid("policy", "target_profit", &e.to_string()))
}

pub fn validate_optimizer_config(config: &dyn ConfigPort) -> Result<(), RebounderError> {
    let d = OptimizerConfig::default();
    if config.get_int("optimizer", "min_samples", d.min_samples as i64) < 1 {
        return Err(invalid("optimizer", "min_samples", "min_samples must be at least 1"));
    }
    if config.get_int("optimizer", "window", d.window as i64) < 1 {
        return Err(invalid("optimizer", "window", "window must be at least 1"));
    }
    let percentile = config.get_double("optimizer", "target_percentile", d.target_percentile);
    if !(0.0..=100.0).contains(&percentile) {
        return Err(invalid(
            "optimizer",
            "target_percentile",
            "target_percentile must be between 0 and 100",
        ));
    }
    let target_min = config.get_double("optimizer", "target_min", d.target_min);
    let target_max = config.get_double("optimizer", "target_max", d.target_max);
    if target_min <= 0.0 {
        return Err(invalid("optimizer", "target_min", "target_min must be positive"));
    }
    if target_max < target_min {
        return Err(invalid(
            "optimizer",
            "target_max",
            "target_max must not be below target_min",
        ));
    }
    if config.get_double("optimizer", "stop_loss", d.stop_loss) >= 0.0 {
        return Err(invalid("optimizer", "stop_loss", "stop_loss must be negative"));
    }
    let averaging_min = config.get_double("optimizer", "averaging_min", d.averaging_min);
    let averaging_max = config.get_double("optimizer", "averaging_max", d.averaging_max);
    if averaging_max >= 0.0 {
        return Err(invalid("optimizer", "averaging_max", "averaging_max must be negative"));
    }
    if averaging_min > averaging_max {
        return Err(invalid(
            "optimizer",
            "averaging_min",
            "averaging_min must not exceed averaging_max",
        ));
    }
    if config.get_int("optimizer", "lookback_days", d.lookback_days) < 1 {
        return Err(invalid("optimizer", "lookback_days", "lookback_days must be positive"));
    }
    Ok(())
}

pub fn validate_calibration_config(config: &dyn ConfigPort) -> Result<(), RebounderError> {
    let d = CalibrationConfig::default();
    if let Some(grid) = double_list(config, "calibration", "take_profit_grid")? {
        if grid.is_empty() || grid.iter().any(|&v| v <= 0.0) {
            return Err(invalid(
                "calibration",
                "take_profit_grid",
                "take_profit_grid must list positive fractions",
            ));
        }
    }
    if let Some(grid) = double_list(config, "calibration", "stop_loss_grid")? {
        if grid.is_empty() || grid.iter().any(|&v| v >= 0.0) {
            return Err(invalid(
                "calibration",
                "stop_loss_grid",
                "stop_loss_grid must list negative fractions",
            ));
        }
    }
    if let Some(levels) = double_list(config, "calibration", "capital_levels")? {
        if levels.is_empty() || levels.iter().any(|&v| v <= 0.0) {
            return Err(invalid(
                "calibration",
                "capital_levels",
                "capital_levels must list positive amounts",
            ));
        }
    }
    if config.get_double("calibration", "per_trade_capital", d.per_trade_capital) <= 0.0 {
        return Err(invalid(
            "calibration",
            "per_trade_capital",
            "per_trade_capital must be positive",
        ));
    }
    let trigger = config.get_double(
        "calibration",
        "averaging_trigger",
        d.averaging_trigger.unwrap_or(-0.03),
    );
    if trigger >= 0.0 {
        return Err(invalid(
            "calibration",
            "averaging_trigger",
            "averaging_trigger must be negative",
        ));
    }
    check_fraction(config, "calibration", "initial_fraction", d.initial_fraction)?;
    check_fraction(config, "calibration", "position_fraction", d.position_fraction)
}

pub fn validate_runtime_config(config: &dyn ConfigPort) -> Result<(), RebounderError> {
    let timeout_ms = ManagerConfig::default().fill_timeout.as_millis() as i64;
    if config.get_int("execution", "fill_timeout_ms", timeout_ms) < 1 {
        return Err(invalid(
            "execution",
            "fill_timeout_ms",
            "fill_timeout_ms must be positive",
        ));
    }
    if config.get_int("manager", "scan_interval_secs", 60) < 1 {
        return Err(invalid(
            "manager",
            "scan_interval_secs",
            "scan_interval_secs must be positive",
        ));
    }
    if config.get_int("sqlite", "pool_size", 4) < 1 {
        return Err(invalid("sqlite", "pool_size", "pool_size must be at least 1"));
    }
    Ok(())
}

/// Parsed list, `None` when absent, an error when present but malformed.
pub fn double_list(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<Vec<f64>>, RebounderError> {
    if config.get_string(section, key).is_none() {
        return Ok(None);
    }
    config
        .get_double_list(section, key)
        .map(Some)
        .ok_or_else(|| invalid(section, key, "expected a comma-separated list of numbers"))
}

fn check_fraction(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<(), RebounderError> {
    let value = config.get_double(section, key, default);
    if value <= 0.0 || value > 1.0 {
        return Err(invalid(
            section,
            key,
            &format!("{key} must be in (0, 1]"),
        ));
    }
    Ok(())
}

fn invalid(section: &str, key: &str, reason: &str) -> RebounderError {
    RebounderError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
