//! Trade notification port trait.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::domain::position::{PositionId, Side};
use crate::domain::simulator::ExitReason;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeNotification {
    Entered {
        id: PositionId,
        instrument: String,
        quantity: i64,
        price: f64,
        at: NaiveDateTime,
    },
    Averaged {
        id: PositionId,
        instrument: String,
        quantity: i64,
        price: f64,
        new_entry_price: f64,
        at: NaiveDateTime,
    },
    Closed {
        id: PositionId,
        instrument: String,
        quantity: i64,
        price: f64,
        reason: ExitReason,
        pnl: f64,
        at: NaiveDateTime,
    },
    FillFailed {
        id: PositionId,
        instrument: String,
        side: Side,
        reason: String,
        at: NaiveDateTime,
    },
}

impl TradeNotification {
    pub fn instrument(&self) -> &str {
        match self {
            TradeNotification::Entered { instrument, .. }
            | TradeNotification::Averaged { instrument, .. }
            | TradeNotification::Closed { instrument, .. }
            | TradeNotification::FillFailed { instrument, .. } => instrument,
        }
    }
}

/// Fire-and-forget delivery. The manager never waits on a notifier and
/// never fails because of one.
pub trait NotifyPort: Send + Sync {
    fn notify(&self, notification: &TradeNotification) -> Result<(), String>;
}
