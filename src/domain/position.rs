//! Position tracking and lifecycle state.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use super::error::RebounderError;
use super::policy::ExitPolicy;
use super::simulator::ExitReason;

pub type PositionId = u64;

/// `PendingEntry → Entered → (Averaged) → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    PendingEntry,
    Entered,
    Averaged,
    Closed,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::PendingEntry => "pending_entry",
            PositionState::Entered => "entered",
            PositionState::Averaged => "averaged",
            PositionState::Closed => "closed",
        }
    }

    pub fn can_transition_to(&self, next: PositionState) -> bool {
        matches!(
            (self, next),
            (PositionState::PendingEntry, PositionState::Entered)
                | (PositionState::Entered, PositionState::Averaged)
                | (PositionState::Entered, PositionState::Closed)
                | (PositionState::Averaged, PositionState::Closed)
        )
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionState {
    type Err = RebounderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_entry" => Ok(PositionState::PendingEntry),
            "entered" => Ok(PositionState::Entered),
            "averaged" => Ok(PositionState::Averaged),
            "closed" => Ok(PositionState::Closed),
            other => Err(RebounderError::InvalidInput {
                reason: format!("unknown position state '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = RebounderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(RebounderError::InvalidInput {
                reason: format!("unknown side '{other}'"),
            }),
        }
    }
}

/// What an order was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPurpose {
    Entry,
    Averaging,
    Exit(ExitReason),
}

impl OrderPurpose {
    pub fn side(&self) -> Side {
        match self {
            OrderPurpose::Entry | OrderPurpose::Averaging => Side::Buy,
            OrderPurpose::Exit(_) => Side::Sell,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            OrderPurpose::Entry => "entry".into(),
            OrderPurpose::Averaging => "averaging".into(),
            OrderPurpose::Exit(reason) => format!("exit:{reason}"),
        }
    }

    pub fn decode(s: &str) -> Result<Self, RebounderError> {
        match s {
            "entry" => Ok(OrderPurpose::Entry),
            "averaging" => Ok(OrderPurpose::Averaging),
            other => match other.strip_prefix("exit:") {
                Some(reason) => Ok(OrderPurpose::Exit(reason.parse()?)),
                None => Err(RebounderError::InvalidInput {
                    reason: format!("unknown order purpose '{other}'"),
                }),
            },
        }
    }
}

/// An order whose outcome is unknown (the fill request timed out).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOrder {
    pub purpose: OrderPurpose,
    pub quantity: i64,
    pub reference_price: f64,
    /// Capital reserved for a buy that has not been confirmed.
    pub reserved: f64,
    pub requested_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub id: PositionId,
    pub instrument: String,
    state: PositionState,
    /// Quantity-weighted average across fills.
    pub entry_price: f64,
    pub quantity: i64,
    /// Capital committed in the ledger for this position.
    pub committed: f64,
    /// Per-trade allotment fixed at entry; caps the averaging tranche.
    pub planned_capital: f64,
    pub averaged: bool,
    /// P&L already booked from units sold while the position stayed open.
    pub realized_pnl: f64,
    pub entry_time: NaiveDateTime,
    pub probability: f64,
    pub policy: ExitPolicy,
    pub pending: Option<PendingOrder>,
}

impl Position {
    pub fn pending_entry(
        id: PositionId,
        instrument: &str,
        planned_capital: f64,
        probability: f64,
        policy: ExitPolicy,
        entry_time: NaiveDateTime,
    ) -> Self {
        Position {
            id,
            instrument: instrument.to_string(),
            state: PositionState::PendingEntry,
            entry_price: 0.0,
            quantity: 0,
            committed: 0.0,
            planned_capital,
            averaged: false,
            realized_pnl: 0.0,
            entry_time,
            probability,
            policy,
            pending: None,
        }
    }

    /// Rebuild a persisted position in a given state. Closed positions are
    /// never part of the open set.
    pub fn with_state(mut self, state: PositionState) -> Result<Self, RebounderError> {
        if state == PositionState::Closed {
            return Err(RebounderError::invariant(format!(
                "position {} cannot be restored as closed",
                self.id
            )));
        }
        self.state = state;
        Ok(self)
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    pub fn transition(&mut self, next: PositionState) -> Result<(), RebounderError> {
        if !self.state.can_transition_to(next) {
            return Err(RebounderError::invariant(format!(
                "position {} ({}) cannot move from {} to {}",
                self.id, self.instrument, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Blend a new fill into the weighted entry price.
    pub fn apply_fill(&mut self, quantity: i64, price: f64) {
        let total = self.quantity + quantity;
        if total > 0 {
            self.entry_price =
                (self.quantity as f64 * self.entry_price + quantity as f64 * price) / total as f64;
        }
        self.quantity = total;
    }

    pub fn current_return(&self, price: f64) -> f64 {
        if self.entry_price > 0.0 {
            price / self.entry_price - 1.0
        } else {
            0.0
        }
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity as f64 * price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.quantity as f64 * (price - self.entry_price)
    }

    /// Whole days since entry.
    pub fn held_periods(&self, now: NaiveDateTime) -> i64 {
        (now.date() - self.entry_time.date()).num_days()
    }

    pub fn needs_reconciliation(&self) -> bool {
        self.pending.is_some()
    }
}

/// Realized trade appended to the history log when a position closes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub id: PositionId,
    pub instrument: String,
    pub quantity: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub capital: f64,
    pub entry_time: NaiveDateTime,
    pub exit_time: NaiveDateTime,
    pub reason: ExitReason,
    pub pnl: f64,
    pub exit_return: f64,
    pub averaged: bool,
}

impl ClosedTrade {
    pub fn holding_days(&self) -> i64 {
        (self.exit_time.date() - self.entry_time.date()).num_days()
    }
}
