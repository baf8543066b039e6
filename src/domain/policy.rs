//! Exit policy value object.
//!
//! An [`ExitPolicy`] bundles the thresholds that govern when a position is
//! closed or added to. All thresholds are signed fractions of the entry price
//! (`0.08` is +8%, `-0.05` is -5%). Policies are only built through
//! [`ExitPolicy::new`], so every value in circulation satisfies
//! `target_profit > 0 > stop_loss` and, when present,
//! `stop_loss < averaging_trigger < 0`.

use serde::Serialize;

use super::error::RebounderError;

/// The one default policy. Used whenever there is no calibrated or
/// personalised policy to fall back on.
pub const DEFAULT_POLICY: ExitPolicy = ExitPolicy {
    target_profit: 0.08,
    stop_loss: -0.05,
    averaging_trigger: Some(-0.03),
    horizon: 5,
};

/// Where a policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Global,
    PerInstrument,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExitPolicy {
    target_profit: f64,
    stop_loss: f64,
    averaging_trigger: Option<f64>,
    horizon: usize,
}

impl ExitPolicy {
    pub fn new(
        target_profit: f64,
        stop_loss: f64,
        averaging_trigger: Option<f64>,
        horizon: usize,
    ) -> Result<Self, RebounderError> {
        if !target_profit.is_finite() || target_profit <= 0.0 {
            return Err(RebounderError::InvalidPolicy {
                reason: format!("target_profit must be positive, got {target_profit}"),
            });
        }
        if !stop_loss.is_finite() || stop_loss >= 0.0 {
            return Err(RebounderError::InvalidPolicy {
                reason: format!("stop_loss must be negative, got {stop_loss}"),
            });
        }
        if let Some(trigger) = averaging_trigger {
            if !trigger.is_finite() || trigger >= 0.0 || trigger <= stop_loss {
                return Err(RebounderError::InvalidPolicy {
                    reason: format!(
                        "averaging_trigger must lie strictly between {stop_loss} and 0, got {trigger}"
                    ),
                });
            }
        }
        if horizon == 0 {
            return Err(RebounderError::InvalidPolicy {
                reason: "horizon must be at least one period".into(),
            });
        }
        Ok(ExitPolicy {
            target_profit,
            stop_loss,
            averaging_trigger,
            horizon,
        })
    }

    pub fn target_profit(&self) -> f64 {
        self.target_profit
    }

    pub fn stop_loss(&self) -> f64 {
        self.stop_loss
    }

    pub fn averaging_trigger(&self) -> Option<f64> {
        self.averaging_trigger
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Same thresholds without the averaging trigger.
    pub fn without_averaging(&self) -> Self {
        ExitPolicy {
            averaging_trigger: None,
            ..*self
        }
    }

    /// Replace the averaging trigger, dropping it when it would not fire
    /// before the stop-loss.
    pub fn with_averaging_if_valid(&self, trigger: Option<f64>) -> Self {
        match trigger {
            Some(t) if t.is_finite() && t < 0.0 && t > self.stop_loss => ExitPolicy {
                averaging_trigger: Some(t),
                ..*self
            },
            _ => self.without_averaging(),
        }
    }
}

impl Default for ExitPolicy {
    fn default() -> Self {
        DEFAULT_POLICY
    }
}

impl std::fmt::Display for ExitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "target +{:.1}% / stop {:.1}%",
            self.target_profit * 100.0,
            self.stop_loss * 100.0
        )?;
        if let Some(trigger) = self.averaging_trigger {
            write!(f, " / average at {:.1}%", trigger * 100.0)?;
        }
        write!(f, " / {} periods", self.horizon)
    }
}
