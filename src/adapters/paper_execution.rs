//! In-process paper execution.
//!
//! Fills every order in full at the instrument's current price. Prices are
//! set by the caller. Failures, latency and partial fills can be injected per
//! instrument.

use crate::domain::error::{Collaborator, RebounderError};
use crate::domain::position::Side;
use crate::ports::execution_port::{ExecutionPort, FillResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// A fill handed out by [`PaperExecution`].
#[derive(Debug, Clone, PartialEq)]
pub struct PaperFill {
    pub instrument: String,
    pub side: Side,
    pub quantity: i64,
    pub price: f64,
}

#[derive(Default)]
struct PaperBook {
    prices: HashMap<String, f64>,
    failing: HashSet<String>,
    fill_limits: HashMap<String, i64>,
    latency: Option<Duration>,
    fills: Vec<PaperFill>,
}

#[derive(Default)]
pub struct PaperExecution {
    book: Mutex<PaperBook>,
}

impl PaperExecution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, instrument: &str, price: f64) {
        self.book().prices.insert(instrument.to_string(), price);
    }

    pub fn clear_price(&self, instrument: &str) {
        self.book().prices.remove(instrument);
    }

    /// Refuse every order for `instrument` until cleared.
    pub fn set_failing(&self, instrument: &str, failing: bool) {
        let mut book = self.book();
        if failing {
            book.failing.insert(instrument.to_string());
        } else {
            book.failing.remove(instrument);
        }
    }

    /// Fill at most `limit` units per order for `instrument`.
    pub fn set_fill_limit(&self, instrument: &str, limit: Option<i64>) {
        let mut book = self.book();
        match limit {
            Some(limit) => book.fill_limits.insert(instrument.to_string(), limit),
            None => book.fill_limits.remove(instrument),
        };
    }

    /// Sleep this long before answering each order.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.book().latency = latency;
    }

    pub fn fills(&self) -> Vec<PaperFill> {
        self.book().fills.clone()
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ExecutionPort for PaperExecution {
    fn submit_fill(
        &self,
        instrument: &str,
        side: Side,
        quantity: i64,
    ) -> Result<FillResult, RebounderError> {
        if quantity <= 0 {
            return Err(RebounderError::InvalidInput {
                reason: format!("order quantity must be positive, got {quantity}"),
            });
        }

        let latency = self.book().latency;
        if let Some(latency) = latency {
            thread::sleep(latency);
        }

        let mut book = self.book();
        if book.failing.contains(instrument) {
            return Err(RebounderError::collaborator(
                Collaborator::Execution,
                format!("paper order for {instrument} refused"),
            ));
        }
        let price = book.prices.get(instrument).copied().ok_or_else(|| {
            RebounderError::collaborator(
                Collaborator::Execution,
                format!("no paper price for {instrument}"),
            )
        })?;
        let filled = book
            .fill_limits
            .get(instrument)
            .map_or(quantity, |limit| quantity.min(*limit).max(0));

        debug!(instrument, %side, quantity = filled, price, "paper fill");
        book.fills.push(PaperFill {
            instrument: instrument.to_string(),
            side,
            quantity: filled,
            price,
        });
        Ok(FillResult {
            quantity: filled,
            avg_price: price,
        })
    }

    fn current_price(&self, instrument: &str) -> Result<Option<f64>, RebounderError> {
        Ok(self.book().prices.get(instrument).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn fills_in_full_at_current_price() {
        let paper = PaperExecution::new();
        paper.set_price("005930", 71_000.0);
        let fill = paper.submit_fill("005930", Side::Buy, 10).unwrap();
        assert_eq!(fill, FillResult { quantity: 10, avg_price: 71_000.0 });
        assert_eq!(paper.current_price("005930").unwrap(), Some(71_000.0));
        assert_eq!(paper.fills().len(), 1);
    }

    #[test]
    fn unpriced_instrument_is_a_collaborator_failure() {
        let paper = PaperExecution::new();
        assert_eq!(paper.current_price("005930").unwrap(), None);
        let err = paper.submit_fill("005930", Side::Buy, 1).unwrap_err();
        assert!(matches!(
            err,
            RebounderError::Collaborator { collaborator: Collaborator::Execution, .. }
        ));
    }

    #[test]
    fn failure_injection_is_per_instrument() {
        let paper = PaperExecution::new();
        paper.set_price("005930", 100.0);
        paper.set_price("000660", 50.0);
        paper.set_failing("005930", true);
        assert!(paper.submit_fill("005930", Side::Sell, 5).is_err());
        assert!(paper.submit_fill("000660", Side::Sell, 5).is_ok());
        paper.set_failing("005930", false);
        assert!(paper.submit_fill("005930", Side::Sell, 5).is_ok());
    }

    #[test]
    fn fill_limit_caps_quantity() {
        let paper = PaperExecution::new();
        paper.set_price("005930", 100.0);
        paper.set_fill_limit("005930", Some(3));
        assert_eq!(paper.submit_fill("005930", Side::Buy, 10).unwrap().quantity, 3);
        paper.set_fill_limit("005930", None);
        assert_eq!(paper.submit_fill("005930", Side::Buy, 10).unwrap().quantity, 10);
    }

    #[test]
    fn latency_delays_the_answer() {
        let paper = PaperExecution::new();
        paper.set_price("005930", 100.0);
        paper.set_latency(Some(Duration::from_millis(50)));
        let started = Instant::now();
        paper.submit_fill("005930", Side::Buy, 1).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn non_positive_quantity_is_invalid() {
        let paper = PaperExecution::new();
        paper.set_price("005930", 100.0);
        assert!(matches!(
            paper.submit_fill("005930", Side::Buy, 0),
            Err(RebounderError::InvalidInput { .. })
        ));
    }
}
