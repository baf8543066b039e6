//! Capital ledger.
//!
//! Tracks capital committed to open positions against a fixed total and a
//! concurrency cap. Every mutation is checked; an operation that would
//! overcommit capital or exceed the cap fails with an invariant violation
//! and leaves the ledger untouched.

use serde::Serialize;

use super::error::RebounderError;

/// Slack for float rounding when comparing committed capital to the total.
const CAPITAL_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapitalLedger {
    total_capital: f64,
    per_trade_cap: f64,
    max_positions: usize,
    committed: f64,
    open_positions: usize,
    realized_pnl: f64,
}

impl CapitalLedger {
    pub fn new(
        total_capital: f64,
        per_trade_cap: f64,
        max_positions: usize,
    ) -> Result<Self, RebounderError> {
        if !(total_capital.is_finite() && total_capital > 0.0) {
            return Err(RebounderError::InvalidInput {
                reason: format!("total capital must be positive, got {total_capital}"),
            });
        }
        if !(per_trade_cap.is_finite() && per_trade_cap > 0.0) {
            return Err(RebounderError::InvalidInput {
                reason: format!("per-trade cap must be positive, got {per_trade_cap}"),
            });
        }
        if max_positions == 0 {
            return Err(RebounderError::InvalidInput {
                reason: "max positions must be at least 1".into(),
            });
        }
        Ok(CapitalLedger {
            total_capital,
            per_trade_cap,
            max_positions,
            committed: 0.0,
            open_positions: 0,
            realized_pnl: 0.0,
        })
    }

    pub fn total_capital(&self) -> f64 {
        self.total_capital
    }

    pub fn per_trade_cap(&self) -> f64 {
        self.per_trade_cap
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn committed(&self) -> f64 {
        self.committed
    }

    pub fn open_positions(&self) -> usize {
        self.open_positions
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn available(&self) -> f64 {
        (self.total_capital - self.committed).max(0.0)
    }

    pub fn has_free_slot(&self) -> bool {
        self.open_positions < self.max_positions
    }

    /// Capital a new position may plan for: the per-trade cap, or whatever
    /// is left if that is less.
    pub fn per_trade_allotment(&self) -> f64 {
        self.per_trade_cap.min(self.available())
    }

    /// Take a position slot and reserve `amount` for its first fill.
    pub fn open_slot(&mut self, amount: f64) -> Result<(), RebounderError> {
        if !self.has_free_slot() {
            return Err(RebounderError::invariant(format!(
                "opening a position would exceed the cap of {}",
                self.max_positions
            )));
        }
        self.check_commit(amount)?;
        self.committed += amount;
        self.open_positions += 1;
        Ok(())
    }

    /// Commit more capital to an already-open position.
    pub fn commit(&mut self, amount: f64) -> Result<(), RebounderError> {
        self.check_commit(amount)?;
        self.committed += amount;
        Ok(())
    }

    /// Return unused reservation to the pool, slot kept.
    pub fn uncommit(&mut self, amount: f64) -> Result<(), RebounderError> {
        if amount < 0.0 || amount > self.committed + CAPITAL_EPSILON {
            return Err(RebounderError::invariant(format!(
                "cannot release {amount:.2}, only {:.2} committed",
                self.committed
            )));
        }
        self.committed = (self.committed - amount).max(0.0);
        Ok(())
    }

    /// Move a reservation to the actual fill cost.
    pub fn true_up(&mut self, reserved: f64, actual: f64) -> Result<(), RebounderError> {
        if actual > reserved {
            self.commit(actual - reserved)
        } else {
            self.uncommit(reserved - actual)
        }
    }

    /// Release a position's capital and slot, booking its realized P&L.
    pub fn close_slot(&mut self, committed: f64, pnl: f64) -> Result<(), RebounderError> {
        if self.open_positions == 0 {
            return Err(RebounderError::invariant("closing a slot with none open"));
        }
        self.uncommit(committed)?;
        self.open_positions -= 1;
        self.realized_pnl += pnl;
        Ok(())
    }

    /// Release the capital behind units sold from a position that stays
    /// open, booking their P&L. The slot is kept.
    pub fn release(&mut self, amount: f64, pnl: f64) -> Result<(), RebounderError> {
        if self.open_positions == 0 {
            return Err(RebounderError::invariant("releasing capital with no slot open"));
        }
        self.uncommit(amount)?;
        self.realized_pnl += pnl;
        Ok(())
    }

    /// Book P&L realized before a restart.
    pub fn book_realized(&mut self, pnl: f64) {
        self.realized_pnl += pnl;
    }

    /// Release a slot whose entry never filled.
    pub fn abandon_slot(&mut self, reserved: f64) -> Result<(), RebounderError> {
        self.close_slot(reserved, 0.0)
    }

    pub fn check_invariants(&self) -> Result<(), RebounderError> {
        if self.committed > self.total_capital + CAPITAL_EPSILON {
            return Err(RebounderError::invariant(format!(
                "committed {:.2} exceeds total capital {:.2}",
                self.committed, self.total_capital
            )));
        }
        if self.open_positions > self.max_positions {
            return Err(RebounderError::invariant(format!(
                "{} open positions exceed cap {}",
                self.open_positions, self.max_positions
            )));
        }
        Ok(())
    }

    fn check_commit(&self, amount: f64) -> Result<(), RebounderError> {
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(RebounderError::invariant(format!(
                "commit amount must be non-negative, got {amount}"
            )));
        }
        if self.committed + amount > self.total_capital + CAPITAL_EPSILON {
            return Err(RebounderError::invariant(format!(
                "committing {amount:.2} would exceed total capital ({:.2} of {:.2} in use)",
                self.committed, self.total_capital
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn ledger() -> CapitalLedger {
        CapitalLedger::new(300_000.0, 100_000.0, 3).unwrap()
    }

    #[test]
    fn new_validates_inputs() {
        assert!(CapitalLedger::new(0.0, 1.0, 1).is_err());
        assert!(CapitalLedger::new(1.0, 0.0, 1).is_err());
        assert!(CapitalLedger::new(1.0, 1.0, 0).is_err());
    }

    #[test]
    fn allotment_is_capped_by_available() {
        let mut l = ledger();
        assert_relative_eq!(l.per_trade_allotment(), 100_000.0);
        l.open_slot(250_000.0).unwrap();
        assert_relative_eq!(l.per_trade_allotment(), 50_000.0);
    }

    #[test]
    fn open_slot_respects_cap() {
        let mut l = ledger();
        for _ in 0..3 {
            l.open_slot(10_000.0).unwrap();
        }
        let before = l.clone();
        assert!(matches!(
            l.open_slot(10_000.0),
            Err(RebounderError::InvariantViolation { .. })
        ));
        assert_eq!(l, before);
    }

    #[test]
    fn commit_refuses_overcommit() {
        let mut l = ledger();
        l.open_slot(290_000.0).unwrap();
        let before = l.clone();
        assert!(l.commit(20_000.0).is_err());
        assert_eq!(l, before);
        l.commit(10_000.0).unwrap();
        assert_relative_eq!(l.available(), 0.0);
    }

    #[test]
    fn true_up_moves_both_ways() {
        let mut l = ledger();
        l.open_slot(50_000.0).unwrap();
        l.true_up(50_000.0, 49_900.0).unwrap();
        assert_relative_eq!(l.committed(), 49_900.0);
        l.true_up(49_900.0, 50_100.0).unwrap();
        assert_relative_eq!(l.committed(), 50_100.0);
    }

    #[test]
    fn close_slot_releases_and_books_pnl() {
        let mut l = ledger();
        l.open_slot(50_000.0).unwrap();
        l.close_slot(50_000.0, 4_000.0).unwrap();
        assert_eq!(l.open_positions(), 0);
        assert_relative_eq!(l.committed(), 0.0);
        assert_relative_eq!(l.realized_pnl(), 4_000.0);
        assert!(l.close_slot(0.0, 0.0).is_err());
    }

    #[test]
    fn release_keeps_the_slot() {
        let mut l = ledger();
        l.open_slot(50_000.0).unwrap();
        l.release(20_000.0, 1_500.0).unwrap();
        assert_eq!(l.open_positions(), 1);
        assert_relative_eq!(l.committed(), 30_000.0);
        assert_relative_eq!(l.realized_pnl(), 1_500.0);
        l.close_slot(30_000.0, 500.0).unwrap();
        assert_relative_eq!(l.realized_pnl(), 2_000.0);
        assert!(l.release(0.0, 0.0).is_err());
    }

    #[test]
    fn uncommit_more_than_committed_fails() {
        let mut l = ledger();
        l.open_slot(1_000.0).unwrap();
        assert!(l.uncommit(2_000.0).is_err());
        assert!(l.uncommit(-1.0).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Open(f64),
        Commit(f64),
        Close(usize, f64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0.0f64..150_000.0).prop_map(Op::Open),
            (0.0f64..150_000.0).prop_map(Op::Commit),
            (0usize..5, -5_000.0f64..5_000.0).prop_map(|(i, p)| Op::Close(i, p)),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_any_sequence(ops in prop::collection::vec(op(), 0..40)) {
            let mut l = ledger();
            let mut slots: Vec<f64> = Vec::new();
            for op in ops {
                match op {
                    Op::Open(amount) => {
                        if l.open_slot(amount).is_ok() {
                            slots.push(amount);
                        }
                    }
                    Op::Commit(amount) => {
                        if let Some(last) = slots.last_mut() {
                            if l.commit(amount).is_ok() {
                                *last += amount;
                            }
                        }
                    }
                    Op::Close(i, pnl) => {
                        if !slots.is_empty() {
                            let amount = slots.remove(i % slots.len());
                            l.close_slot(amount, pnl).unwrap();
                        }
                    }
                }
                prop_assert!(l.check_invariants().is_ok());
                prop_assert!(l.committed() <= l.total_capital() + CAPITAL_EPSILON);
                prop_assert!(l.open_positions() <= l.max_positions());
                prop_assert_eq!(l.open_positions(), slots.len());
            }
        }
    }
}
