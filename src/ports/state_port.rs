//! Persistent lifecycle state port trait.

use crate::domain::error::RebounderError;
use crate::domain::policy::ExitPolicy;
use crate::domain::position::{ClosedTrade, Position, PositionId};

pub trait StatePort: Send + Sync {
    /// Insert or replace an open position.
    fn save_position(&self, position: &Position) -> Result<(), RebounderError>;

    fn remove_position(&self, id: PositionId) -> Result<(), RebounderError>;

    fn load_positions(&self) -> Result<Vec<Position>, RebounderError>;

    /// Append a realized trade. Appending the same position id twice keeps
    /// the first record.
    fn append_trade(&self, trade: &ClosedTrade) -> Result<(), RebounderError>;

    fn load_trades(&self) -> Result<Vec<ClosedTrade>, RebounderError>;

    fn save_global_policy(&self, policy: &ExitPolicy) -> Result<(), RebounderError>;

    fn load_global_policy(&self) -> Result<Option<ExitPolicy>, RebounderError>;
}
