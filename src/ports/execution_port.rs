//! Order execution port trait.

use crate::domain::error::RebounderError;
use crate::domain::position::Side;

/// Confirmed fill. `quantity` may be less than requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillResult {
    pub quantity: i64,
    pub avg_price: f64,
}

pub trait ExecutionPort: Send + Sync {
    /// Submit a market order and block until the broker confirms or refuses.
    /// Callers bound the wait themselves.
    fn submit_fill(
        &self,
        instrument: &str,
        side: Side,
        quantity: i64,
    ) -> Result<FillResult, RebounderError>;

    /// Latest traded price, `None` when the instrument has not traded.
    fn current_price(&self, instrument: &str) -> Result<Option<f64>, RebounderError>;
}
