//! Position lifecycle manager.
//!
//! Owns the capital ledger and the open-position set and drives each
//! position through `PendingEntry → Entered → (Averaged) → Closed`.
//!
//! Locking: the [`Book`] (ledger plus positions) sits behind one mutex, so
//! capital is reserved and released atomically. A second, per-instrument
//! mutex serialises the operations on one position. The book lock is never
//! held while an order is with the execution collaborator, so positions in
//! different instruments progress independently.
//!
//! Fills run on a worker thread and are bounded by the configured timeout.
//! A fill that times out leaves its position flagged; every later
//! evaluation returns [`RebounderError::ReconciliationRequired`] until
//! [`PositionManager::reconcile`] records what actually happened.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::crash_event::CrashEvent;
use super::error::{Collaborator, RebounderError, RejectReason};
use super::ledger::CapitalLedger;
use super::notifier::NotificationDispatcher;
use super::policy::ExitPolicy;
use super::position::{ClosedTrade, OrderPurpose, PendingOrder, Position, PositionId, PositionState, Side};
use super::simulator::ExitReason;
use crate::ports::execution_port::{ExecutionPort, FillResult};
use crate::ports::notify_port::{NotifyPort, TradeNotification};
use crate::ports::scoring_port::ScoringPort;
use crate::ports::state_port::StatePort;

/// Price-derived returns are compared with this much slack.
const RETURN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub total_capital: f64,
    pub per_trade_cap: f64,
    pub max_positions: usize,
    /// Share of the per-trade allotment bought on entry.
    pub initial_fraction: f64,
    pub min_probability: f64,
    pub fill_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            total_capital: 10_000_000.0,
            per_trade_cap: 1_000_000.0,
            max_positions: 5,
            initial_fraction: 0.5,
            min_probability: 0.6,
            fill_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Prices observed for one instrument since the last evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quote {
    pub last: f64,
    pub high: f64,
    pub low: f64,
}

impl Quote {
    pub fn last(price: f64) -> Self {
        Quote {
            last: price,
            high: price,
            low: price,
        }
    }
}

/// What an evaluation decided for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    Exit(ExitReason),
    Average,
}

/// Result of a completed evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Hold,
    Averaged(Position),
    Closed(ClosedTrade),
}

/// What actually happened to an order whose fill timed out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    Filled { quantity: i64, avg_price: f64 },
    NotFilled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Open(Position),
    Closed(ClosedTrade),
    /// An entry that never filled; the reservation was released.
    Abandoned,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub evaluated: Vec<(PositionId, Evaluation)>,
    /// Positions with an operation in flight.
    pub skipped: Vec<PositionId>,
    pub unpriced: Vec<PositionId>,
    pub failed: Vec<(PositionId, RebounderError)>,
}

struct Book {
    ledger: CapitalLedger,
    positions: BTreeMap<PositionId, Position>,
    closed: HashSet<PositionId>,
    next_id: PositionId,
}

enum FillOutcome {
    Filled(FillResult),
    Failed(RebounderError),
    TimedOut,
}

pub struct PositionManager {
    config: ManagerConfig,
    book: Mutex<Book>,
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    execution: Arc<dyn ExecutionPort>,
    state: Arc<dyn StatePort>,
    scoring: Option<Arc<dyn ScoringPort>>,
    notifier: NotificationDispatcher,
}

impl PositionManager {
    pub fn new(
        config: ManagerConfig,
        execution: Arc<dyn ExecutionPort>,
        state: Arc<dyn StatePort>,
    ) -> Result<Self, RebounderError> {
        if !(config.initial_fraction > 0.0 && config.initial_fraction <= 1.0) {
            return Err(RebounderError::InvalidInput {
                reason: format!(
                    "initial fraction must be in (0, 1], got {}",
                    config.initial_fraction
                ),
            });
        }
        if !(0.0..=1.0).contains(&config.min_probability) {
            return Err(RebounderError::InvalidInput {
                reason: format!(
                    "probability threshold must be in [0, 1], got {}",
                    config.min_probability
                ),
            });
        }
        if config.fill_timeout.is_zero() {
            return Err(RebounderError::InvalidInput {
                reason: "fill timeout must be positive".into(),
            });
        }
        let ledger = CapitalLedger::new(
            config.total_capital,
            config.per_trade_cap,
            config.max_positions,
        )?;
        Ok(PositionManager {
            config,
            book: Mutex::new(Book {
                ledger,
                positions: BTreeMap::new(),
                closed: HashSet::new(),
                next_id: 1,
            }),
            guards: Mutex::new(HashMap::new()),
            execution,
            state,
            scoring: None,
            notifier: NotificationDispatcher::disabled(),
        })
    }

    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringPort>) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotifyPort>) -> Self {
        self.notifier = NotificationDispatcher::spawn(notifier);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Reload open positions and closed ids from the state store.
    ///
    /// A position that already appears in the trade history is dropped from
    /// the open set. Realized P&L is summed back from the trade history and
    /// from partial sales of positions still open. Returns the number of open
    /// positions restored.
    pub fn restore(&self) -> Result<usize, RebounderError> {
        let trades = self.state.load_trades()?;
        let positions = self.state.load_positions()?;

        let mut book = lock(&self.book);
        if !book.positions.is_empty() {
            return Err(RebounderError::invariant(
                "restore called on a manager with open positions",
            ));
        }
        let closed: HashSet<PositionId> = trades.iter().map(|t| t.id).collect();
        let mut ledger = book.ledger.clone();
        let mut restored = BTreeMap::new();
        for position in positions {
            if closed.contains(&position.id) {
                warn!(
                    id = position.id,
                    instrument = %position.instrument,
                    "position already in trade history, dropping from open set"
                );
                if let Err(e) = self.state.remove_position(position.id) {
                    error!(id = position.id, error = %e, "failed to remove stale open position");
                }
                continue;
            }
            ledger.open_slot(position.committed + reserved_for(&position))?;
            restored.insert(position.id, position);
        }

        let max_id = restored
            .keys()
            .chain(closed.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let realized = trades.iter().map(|t| t.pnl).sum::<f64>()
            + restored.values().map(|p| p.realized_pnl).sum::<f64>();
        ledger.book_realized(realized);
        let count = restored.len();
        book.ledger = ledger;
        book.positions = restored;
        book.next_id = max_id + 1;
        book.closed = closed;
        info!(
            open = count,
            closed = book.closed.len(),
            realized_pnl = realized,
            "restored lifecycle state"
        );
        Ok(count)
    }

    /// Open a position for a crash event at its reference close.
    pub fn open(
        &self,
        event: &CrashEvent,
        policy: &ExitPolicy,
        now: NaiveDateTime,
    ) -> Result<Position, RebounderError> {
        let instrument = event.instrument.as_str();
        let price = event.close;
        if !(price.is_finite() && price > 0.0) {
            return Err(RebounderError::InvalidInput {
                reason: format!("entry price for {instrument} must be positive, got {price}"),
            });
        }
        let probability = self.probability(event)?;
        if probability < self.config.min_probability {
            return Err(self.reject(
                instrument,
                now,
                RejectReason::BelowThreshold {
                    probability,
                    threshold: self.config.min_probability,
                },
            ));
        }

        let guard = self.guard(instrument);
        let _held = lock(&guard);

        let pending = {
            let mut book = lock(&self.book);
            if book.positions.values().any(|p| p.instrument == instrument) {
                let err = RebounderError::invariant(format!(
                    "{instrument} already has an open position"
                ));
                error!(instrument, at = %now, error = %err, "entry refused");
                return Err(err);
            }
            if !book.ledger.has_free_slot() {
                let reason = RejectReason::ConcurrencyCap {
                    open: book.ledger.open_positions(),
                    cap: book.ledger.max_positions(),
                };
                drop(book);
                return Err(self.reject(instrument, now, reason));
            }
            let planned = book.ledger.per_trade_allotment();
            let quantity = (planned * self.config.initial_fraction / price).floor() as i64;
            if quantity < 1 {
                let reason = RejectReason::InsufficientCapital {
                    available: book.ledger.available(),
                    price,
                };
                drop(book);
                return Err(self.reject(instrument, now, reason));
            }
            let reserved = quantity as f64 * price;
            book.ledger.open_slot(reserved)?;

            let id = book.next_id;
            book.next_id += 1;
            let mut position =
                Position::pending_entry(id, instrument, planned, probability, *policy, now);
            position.pending = Some(PendingOrder {
                purpose: OrderPurpose::Entry,
                quantity,
                reference_price: price,
                reserved,
                requested_at: now,
            });
            book.positions.insert(id, position.clone());
            position
        };
        self.persist(&pending);
        let id = pending.id;
        let Some(order) = pending.pending.clone() else {
            return Err(RebounderError::invariant("pending entry without an order"));
        };

        debug!(id, instrument, quantity = order.quantity, price, "requesting entry fill");
        match self.submit(instrument, Side::Buy, order.quantity) {
            FillOutcome::Filled(fill) => {
                let position = {
                    let mut book = lock(&self.book);
                    let Book {
                        ledger, positions, ..
                    } = &mut *book;
                    let position = positions
                        .get_mut(&id)
                        .ok_or(RebounderError::PositionNotFound { id })?;
                    if confirm_entry(ledger, position, &order, fill).is_err() {
                        return Err(RebounderError::ReconciliationRequired {
                            id,
                            instrument: instrument.to_string(),
                        });
                    }
                    position.clone()
                };
                self.persist(&position);
                info!(
                    id,
                    instrument,
                    quantity = position.quantity,
                    price = position.entry_price,
                    at = %now,
                    "entered"
                );
                self.notifier.send(TradeNotification::Entered {
                    id,
                    instrument: instrument.to_string(),
                    quantity: position.quantity,
                    price: position.entry_price,
                    at: now,
                });
                Ok(position)
            }
            FillOutcome::Failed(err) => {
                {
                    let mut book = lock(&self.book);
                    book.ledger.abandon_slot(order.reserved)?;
                    book.positions.remove(&id);
                }
                if let Err(e) = self.state.remove_position(id) {
                    error!(id, instrument, error = %e, "failed to remove abandoned entry");
                }
                self.fill_failed(id, instrument, Side::Buy, &err, now);
                Err(err)
            }
            FillOutcome::TimedOut => Err(self.fill_timed_out(id, instrument, Side::Buy, now)),
        }
    }

    /// Evaluate a position against a single observed price.
    pub fn evaluate(
        &self,
        id: PositionId,
        price: f64,
        now: NaiveDateTime,
    ) -> Result<Evaluation, RebounderError> {
        self.evaluate_quote(id, Quote::last(price), now)
    }

    /// Evaluate a position against a quote. Precedence: target profit, stop
    /// loss, horizon expiry, averaging.
    pub fn evaluate_quote(
        &self,
        id: PositionId,
        quote: Quote,
        now: NaiveDateTime,
    ) -> Result<Evaluation, RebounderError> {
        let instrument = self.instrument_of(id)?;
        let guard = self.guard(&instrument);
        let _held = lock(&guard);
        self.evaluate_locked(id, quote, now)
    }

    /// Evaluate every open position at the execution collaborator's current
    /// price. Positions with an operation in flight are skipped, not queued.
    pub fn scan(&self, now: NaiveDateTime) -> ScanReport {
        let targets: Vec<(PositionId, String)> = lock(&self.book)
            .positions
            .values()
            .map(|p| (p.id, p.instrument.clone()))
            .collect();

        let mut report = ScanReport::default();
        for (id, instrument) in targets {
            let guard = self.guard(&instrument);
            let _held = match guard.try_lock() {
                Ok(held) => held,
                Err(TryLockError::WouldBlock) => {
                    debug!(id, %instrument, "evaluation in flight, skipping");
                    report.skipped.push(id);
                    continue;
                }
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };
            if !lock(&self.book).positions.contains_key(&id) {
                continue;
            }
            match self.execution.current_price(&instrument) {
                Ok(Some(price)) => match self.evaluate_locked(id, Quote::last(price), now) {
                    Ok(evaluation) => report.evaluated.push((id, evaluation)),
                    Err(e) => report.failed.push((id, e)),
                },
                Ok(None) => report.unpriced.push(id),
                Err(e) => {
                    warn!(id, %instrument, error = %e, "no price for scan");
                    report.failed.push((id, e));
                }
            }
        }
        report
    }

    /// Record the real outcome of an order whose fill timed out.
    pub fn reconcile(
        &self,
        id: PositionId,
        resolution: Resolution,
        now: NaiveDateTime,
    ) -> Result<Reconciled, RebounderError> {
        let instrument = self.instrument_of(id)?;
        let guard = self.guard(&instrument);
        let _held = lock(&guard);

        if let Resolution::Filled {
            quantity,
            avg_price,
        } = resolution
        {
            if quantity < 1 || !(avg_price.is_finite() && avg_price > 0.0) {
                return Err(RebounderError::InvalidInput {
                    reason: format!("invalid fill {quantity} @ {avg_price}"),
                });
            }
        }

        let position = self.snapshot(id)?;
        let Some(order) = position.pending.clone() else {
            return Err(RebounderError::InvalidInput {
                reason: format!("position {id} has no order awaiting reconciliation"),
            });
        };
        info!(id, %instrument, purpose = %order.purpose.encode(), ?resolution, "reconciling");

        match (order.purpose, resolution) {
            (OrderPurpose::Entry, Resolution::Filled { quantity, avg_price }) => {
                let position = self.update(id, |ledger, position| {
                    confirm_entry(ledger, position, &order, FillResult { quantity, avg_price })
                })?;
                self.persist(&position);
                Ok(Reconciled::Open(position))
            }
            (OrderPurpose::Entry, Resolution::NotFilled) => {
                {
                    let mut book = lock(&self.book);
                    book.ledger.abandon_slot(order.reserved)?;
                    book.positions.remove(&id);
                }
                if let Err(e) = self.state.remove_position(id) {
                    error!(id, %instrument, error = %e, "failed to remove abandoned entry");
                }
                Ok(Reconciled::Abandoned)
            }
            (OrderPurpose::Averaging, Resolution::Filled { quantity, avg_price }) => {
                let position = self.update(id, |ledger, position| {
                    confirm_averaging(ledger, position, order.reserved, FillResult { quantity, avg_price })
                })?;
                self.persist(&position);
                Ok(Reconciled::Open(position))
            }
            (OrderPurpose::Averaging, Resolution::NotFilled) => {
                let position = self.update(id, |ledger, position| {
                    ledger.uncommit(order.reserved)?;
                    position.pending = None;
                    Ok(())
                })?;
                self.persist(&position);
                Ok(Reconciled::Open(position))
            }
            (OrderPurpose::Exit(reason), Resolution::Filled { quantity, avg_price }) => {
                if quantity > position.quantity {
                    return Err(RebounderError::InvalidInput {
                        reason: format!(
                            "exit fill of {quantity} exceeds the position's {} units",
                            position.quantity
                        ),
                    });
                }
                if quantity == position.quantity {
                    return Ok(Reconciled::Closed(self.finish_exit(id, avg_price, reason, now)?));
                }
                let position = self.update(id, |ledger, position| {
                    confirm_partial_exit(ledger, position, FillResult { quantity, avg_price })
                })?;
                self.persist(&position);
                info!(
                    id,
                    %instrument,
                    sold = quantity,
                    remaining = position.quantity,
                    price = avg_price,
                    realized_pnl = position.realized_pnl,
                    "partial exit recorded"
                );
                Ok(Reconciled::Open(position))
            }
            (OrderPurpose::Exit(_), Resolution::NotFilled) => {
                let position = self.update(id, |_, position| {
                    position.pending = None;
                    Ok(())
                })?;
                self.persist(&position);
                Ok(Reconciled::Open(position))
            }
        }
    }

    pub fn position(&self, id: PositionId) -> Option<Position> {
        lock(&self.book).positions.get(&id).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        lock(&self.book).positions.values().cloned().collect()
    }

    pub fn ledger(&self) -> CapitalLedger {
        lock(&self.book).ledger.clone()
    }

    /// Ledger invariants plus agreement between the ledger and the open set.
    pub fn check_invariants(&self) -> Result<(), RebounderError> {
        let book = lock(&self.book);
        book.ledger.check_invariants()?;
        if book.ledger.open_positions() != book.positions.len() {
            return Err(RebounderError::invariant(format!(
                "ledger counts {} open positions, book holds {}",
                book.ledger.open_positions(),
                book.positions.len()
            )));
        }
        let committed: f64 = book
            .positions
            .values()
            .map(|p| p.committed + reserved_for(p))
            .sum();
        if (committed - book.ledger.committed()).abs() > 1e-6 * book.ledger.total_capital().max(1.0)
        {
            return Err(RebounderError::invariant(format!(
                "positions hold {committed:.2}, ledger has {:.2} committed",
                book.ledger.committed()
            )));
        }
        if let Some(id) = book.positions.keys().find(|id| book.closed.contains(id)) {
            return Err(RebounderError::invariant(format!(
                "closed position {id} is still in the open set"
            )));
        }
        Ok(())
    }

    fn evaluate_locked(
        &self,
        id: PositionId,
        quote: Quote,
        now: NaiveDateTime,
    ) -> Result<Evaluation, RebounderError> {
        let position = self.snapshot(id)?;
        if position.needs_reconciliation() {
            return Err(RebounderError::ReconciliationRequired {
                id,
                instrument: position.instrument,
            });
        }
        if position.state() == PositionState::PendingEntry {
            return Err(RebounderError::invariant(format!(
                "position {id} is pending entry with no order outstanding"
            )));
        }

        match decide(&position, quote, now) {
            Decision::Hold => Ok(Evaluation::Hold),
            Decision::Exit(reason) => self.exit(&position, quote.last, reason, now),
            Decision::Average => self.average(&position, quote.last, now),
        }
    }

    fn exit(
        &self,
        position: &Position,
        price: f64,
        reason: ExitReason,
        now: NaiveDateTime,
    ) -> Result<Evaluation, RebounderError> {
        let id = position.id;
        let instrument = position.instrument.as_str();
        debug!(id, instrument, %reason, price, "requesting exit fill");
        match self.submit(instrument, Side::Sell, position.quantity) {
            FillOutcome::Filled(fill) if fill.quantity == position.quantity => Ok(
                Evaluation::Closed(self.finish_exit(id, fill.avg_price, reason, now)?),
            ),
            FillOutcome::Filled(fill) => {
                self.flag(id, OrderPurpose::Exit(reason), position.quantity, price, 0.0, now)?;
                let err = RebounderError::collaborator(
                    Collaborator::Execution,
                    format!(
                        "partial exit fill for {instrument}: {} of {} units; reconcile position {id}",
                        fill.quantity, position.quantity
                    ),
                );
                self.fill_failed(id, instrument, Side::Sell, &err, now);
                Err(err)
            }
            FillOutcome::Failed(err) => {
                self.fill_failed(id, instrument, Side::Sell, &err, now);
                Err(err)
            }
            FillOutcome::TimedOut => {
                self.flag(id, OrderPurpose::Exit(reason), position.quantity, price, 0.0, now)?;
                Err(self.fill_timed_out(id, instrument, Side::Sell, now))
            }
        }
    }

    fn average(
        &self,
        position: &Position,
        price: f64,
        now: NaiveDateTime,
    ) -> Result<Evaluation, RebounderError> {
        let id = position.id;
        let instrument = position.instrument.as_str();
        let (quantity, reserved) = {
            let mut book = lock(&self.book);
            let budget = (position.planned_capital - position.committed)
                .max(0.0)
                .min(book.ledger.available());
            let quantity = (budget / price).floor() as i64;
            if quantity < 1 {
                debug!(id, instrument, budget, price, "averaging tranche unaffordable");
                return Ok(Evaluation::Hold);
            }
            let reserved = quantity as f64 * price;
            book.ledger.commit(reserved)?;
            (quantity, reserved)
        };

        debug!(id, instrument, quantity, price, "requesting averaging fill");
        match self.submit(instrument, Side::Buy, quantity) {
            FillOutcome::Filled(fill) => {
                let updated = self.update(id, |ledger, position| {
                    confirm_averaging(ledger, position, reserved, fill)
                })?;
                self.persist(&updated);
                self.notifier.send(TradeNotification::Averaged {
                    id,
                    instrument: instrument.to_string(),
                    quantity: fill.quantity,
                    price: fill.avg_price,
                    new_entry_price: updated.entry_price,
                    at: now,
                });
                Ok(Evaluation::Averaged(updated))
            }
            FillOutcome::Failed(err) => {
                lock(&self.book).ledger.uncommit(reserved)?;
                self.fill_failed(id, instrument, Side::Buy, &err, now);
                Err(err)
            }
            FillOutcome::TimedOut => {
                self.flag(id, OrderPurpose::Averaging, quantity, price, reserved, now)?;
                Err(self.fill_timed_out(id, instrument, Side::Buy, now))
            }
        }
    }

    /// Close a position at `exit_price`. The realized trade is appended
    /// before the position leaves the open set; if that append fails the
    /// position stays open, flagged with the exit for reconciliation.
    fn finish_exit(
        &self,
        id: PositionId,
        exit_price: f64,
        reason: ExitReason,
        now: NaiveDateTime,
    ) -> Result<ClosedTrade, RebounderError> {
        let (trade, pnl) = {
            let book = lock(&self.book);
            let position = book
                .positions
                .get(&id)
                .ok_or(RebounderError::PositionNotFound { id })?;
            let pnl = position.quantity as f64 * (exit_price - position.entry_price);
            // Dry run so the ledger cannot refuse the close once the trade is on record.
            book.ledger.clone().close_slot(position.committed, pnl)?;
            let trade = ClosedTrade {
                id,
                instrument: position.instrument.clone(),
                quantity: position.quantity,
                entry_price: position.entry_price,
                exit_price,
                capital: position.committed,
                entry_time: position.entry_time,
                exit_time: now,
                reason,
                pnl: position.realized_pnl + pnl,
                exit_return: position.current_return(exit_price),
                averaged: position.averaged,
            };
            (trade, pnl)
        };

        if let Err(e) = self.state.append_trade(&trade) {
            error!(
                id,
                instrument = %trade.instrument,
                quantity = trade.quantity,
                exit_price,
                error = %e,
                "failed to record closed trade, position flagged"
            );
            self.flag(id, OrderPurpose::Exit(reason), trade.quantity, exit_price, 0.0, now)?;
            return Err(RebounderError::collaborator(
                Collaborator::State,
                format!(
                    "sold {} units of {} at {exit_price} but the trade was not recorded ({e}); \
                     reconcile position {id}",
                    trade.quantity, trade.instrument
                ),
            ));
        }

        {
            let mut book = lock(&self.book);
            let Book {
                ledger,
                positions,
                closed,
                ..
            } = &mut *book;
            let position = positions
                .get_mut(&id)
                .ok_or(RebounderError::PositionNotFound { id })?;
            ledger.close_slot(position.committed, pnl)?;
            position.pending = None;
            position.transition(PositionState::Closed)?;
            positions.remove(&id);
            closed.insert(id);
        }
        if let Err(e) = self.state.remove_position(id) {
            error!(id, instrument = %trade.instrument, error = %e, "failed to remove closed position");
        }
        info!(
            id,
            instrument = %trade.instrument,
            %reason,
            exit_price,
            pnl = trade.pnl,
            at = %now,
            "closed"
        );
        self.notifier.send(TradeNotification::Closed {
            id,
            instrument: trade.instrument.clone(),
            quantity: trade.quantity,
            price: exit_price,
            reason,
            pnl: trade.pnl,
            at: now,
        });
        Ok(trade)
    }

    fn probability(&self, event: &CrashEvent) -> Result<f64, RebounderError> {
        let probability = match (event.rebound_probability, &self.scoring) {
            (Some(p), _) => p,
            (None, Some(scoring)) => scoring.score(event)?,
            (None, None) => {
                return Err(RebounderError::collaborator(
                    Collaborator::Scoring,
                    format!("no probability for {} and no scoring model", event.instrument),
                ));
            }
        };
        if (0.0..=1.0).contains(&probability) {
            Ok(probability)
        } else {
            Err(RebounderError::collaborator(
                Collaborator::Scoring,
                format!("probability {probability} for {} is outside [0, 1]", event.instrument),
            ))
        }
    }

    fn submit(&self, instrument: &str, side: Side, quantity: i64) -> FillOutcome {
        let (tx, rx) = mpsc::channel();
        let execution = Arc::clone(&self.execution);
        let symbol = instrument.to_string();
        thread::spawn(move || {
            let _ = tx.send(execution.submit_fill(&symbol, side, quantity));
        });
        match rx.recv_timeout(self.config.fill_timeout) {
            Ok(Ok(fill)) => {
                if fill.quantity < 1
                    || fill.quantity > quantity
                    || !(fill.avg_price.is_finite() && fill.avg_price > 0.0)
                {
                    FillOutcome::Failed(RebounderError::collaborator(
                        Collaborator::Execution,
                        format!(
                            "unusable {side} fill for {instrument}: {} @ {} (requested {quantity})",
                            fill.quantity, fill.avg_price
                        ),
                    ))
                } else {
                    FillOutcome::Filled(fill)
                }
            }
            Ok(Err(e)) => FillOutcome::Failed(e),
            Err(RecvTimeoutError::Timeout) => FillOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => FillOutcome::Failed(
                RebounderError::collaborator(Collaborator::Execution, "fill worker exited"),
            ),
        }
    }

    fn flag(
        &self,
        id: PositionId,
        purpose: OrderPurpose,
        quantity: i64,
        reference_price: f64,
        reserved: f64,
        now: NaiveDateTime,
    ) -> Result<(), RebounderError> {
        let position = self.update(id, |_, position| {
            position.pending = Some(PendingOrder {
                purpose,
                quantity,
                reference_price,
                reserved,
                requested_at: now,
            });
            Ok(())
        })?;
        self.persist(&position);
        Ok(())
    }

    fn fill_timed_out(
        &self,
        id: PositionId,
        instrument: &str,
        side: Side,
        now: NaiveDateTime,
    ) -> RebounderError {
        let err = RebounderError::FillTimeout {
            instrument: instrument.to_string(),
            side: side.to_string(),
            timeout_ms: self.config.fill_timeout.as_millis() as u64,
        };
        warn!(id, instrument, at = %now, error = %err, "fill timed out, position flagged");
        self.notifier.send(TradeNotification::FillFailed {
            id,
            instrument: instrument.to_string(),
            side,
            reason: err.to_string(),
            at: now,
        });
        err
    }

    fn fill_failed(
        &self,
        id: PositionId,
        instrument: &str,
        side: Side,
        err: &RebounderError,
        now: NaiveDateTime,
    ) {
        warn!(id, instrument, %side, at = %now, error = %err, "fill failed");
        self.notifier.send(TradeNotification::FillFailed {
            id,
            instrument: instrument.to_string(),
            side,
            reason: err.to_string(),
            at: now,
        });
    }

    fn reject(&self, instrument: &str, now: NaiveDateTime, reason: RejectReason) -> RebounderError {
        warn!(instrument, at = %now, %reason, "entry rejected");
        RebounderError::EntryRejected {
            instrument: instrument.to_string(),
            reason,
        }
    }

    fn update<F>(&self, id: PositionId, apply: F) -> Result<Position, RebounderError>
    where
        F: FnOnce(&mut CapitalLedger, &mut Position) -> Result<(), RebounderError>,
    {
        let mut book = lock(&self.book);
        let Book {
            ledger, positions, ..
        } = &mut *book;
        let position = positions
            .get_mut(&id)
            .ok_or(RebounderError::PositionNotFound { id })?;
        apply(ledger, position)?;
        Ok(position.clone())
    }

    fn snapshot(&self, id: PositionId) -> Result<Position, RebounderError> {
        let book = lock(&self.book);
        match book.positions.get(&id) {
            Some(position) => Ok(position.clone()),
            None => Err(missing(&book, id)),
        }
    }

    fn instrument_of(&self, id: PositionId) -> Result<String, RebounderError> {
        let book = lock(&self.book);
        match book.positions.get(&id) {
            Some(position) => Ok(position.instrument.clone()),
            None => Err(missing(&book, id)),
        }
    }

    fn guard(&self, instrument: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            lock(&self.guards)
                .entry(instrument.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn persist(&self, position: &Position) {
        if let Err(e) = self.state.save_position(position) {
            error!(
                id = position.id,
                instrument = %position.instrument,
                error = %e,
                "failed to persist position"
            );
        }
    }
}

/// Lifecycle decision for `position` given `quote` at `now`.
pub fn decide(position: &Position, quote: Quote, now: NaiveDateTime) -> Decision {
    let policy = &position.policy;
    let best = position.current_return(quote.high.max(quote.last));
    let worst = position.current_return(quote.low.min(quote.last));
    let last = position.current_return(quote.last);

    if best >= policy.target_profit() - RETURN_EPSILON {
        Decision::Exit(ExitReason::TargetProfit)
    } else if worst <= policy.stop_loss() + RETURN_EPSILON {
        Decision::Exit(ExitReason::StopLoss)
    } else if position.held_periods(now) >= policy.horizon() as i64 {
        Decision::Exit(ExitReason::HorizonExpiry)
    } else if position.state() == PositionState::Entered
        && !position.averaged
        && policy
            .averaging_trigger()
            .is_some_and(|trigger| last <= trigger + RETURN_EPSILON)
    {
        Decision::Average
    } else {
        Decision::Hold
    }
}

fn confirm_entry(
    ledger: &mut CapitalLedger,
    position: &mut Position,
    order: &PendingOrder,
    fill: FillResult,
) -> Result<(), RebounderError> {
    let cost = fill.quantity as f64 * fill.avg_price;
    if let Err(e) = ledger.true_up(order.reserved, cost) {
        error!(
            id = position.id,
            instrument = %position.instrument,
            quantity = fill.quantity,
            price = fill.avg_price,
            reserved = order.reserved,
            cost,
            error = %e,
            "entry filled beyond available capital, position needs reconciliation"
        );
        return Err(e);
    }
    position.apply_fill(fill.quantity, fill.avg_price);
    position.committed = cost;
    position.pending = None;
    position.transition(PositionState::Entered)
}

/// Take units sold by a partial exit off a position that stays open.
fn confirm_partial_exit(
    ledger: &mut CapitalLedger,
    position: &mut Position,
    fill: FillResult,
) -> Result<(), RebounderError> {
    let released = position.committed * fill.quantity as f64 / position.quantity as f64;
    let pnl = fill.quantity as f64 * (fill.avg_price - position.entry_price);
    ledger.release(released, pnl)?;
    position.quantity -= fill.quantity;
    position.committed -= released;
    position.realized_pnl += pnl;
    position.pending = None;
    Ok(())
}

fn confirm_averaging(
    ledger: &mut CapitalLedger,
    position: &mut Position,
    reserved: f64,
    fill: FillResult,
) -> Result<(), RebounderError> {
    if position.averaged || !position.state().can_transition_to(PositionState::Averaged) {
        return Err(RebounderError::invariant(format!(
            "position {} ({}) cannot average from {}",
            position.id,
            position.instrument,
            position.state()
        )));
    }
    let cost = fill.quantity as f64 * fill.avg_price;
    ledger.true_up(reserved, cost)?;
    position.transition(PositionState::Averaged)?;
    position.apply_fill(fill.quantity, fill.avg_price);
    position.committed += cost;
    position.averaged = true;
    position.pending = None;
    Ok(())
}

/// Capital reserved for an unconfirmed buy.
fn reserved_for(position: &Position) -> f64 {
    match &position.pending {
        Some(order) if order.purpose.side() == Side::Buy => order.reserved,
        _ => 0.0,
    }
}

fn missing(book: &Book, id: PositionId) -> RebounderError {
    if book.closed.contains(&id) {
        RebounderError::invariant(format!("position {id} is closed"))
    } else {
        RebounderError::PositionNotFound { id }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::crash_event::ForwardPeriod;
    use crate::domain::policy::DEFAULT_POLICY;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Broker {
        fail: AtomicBool,
        stall: AtomicBool,
        partial: AtomicBool,
        prices: Mutex<HashMap<String, f64>>,
    }

    impl Broker {
        fn set_price(&self, instrument: &str, price: f64) {
            self.prices.lock().unwrap().insert(instrument.into(), price);
        }
    }

    impl ExecutionPort for Broker {
        fn submit_fill(
            &self,
            instrument: &str,
            _side: Side,
            quantity: i64,
        ) -> Result<FillResult, RebounderError> {
            if self.stall.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(300));
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(RebounderError::collaborator(Collaborator::Execution, "rejected"));
            }
            let price = self.prices.lock().unwrap().get(instrument).copied().unwrap_or(100.0);
            let quantity = if self.partial.load(Ordering::SeqCst) {
                quantity - 1
            } else {
                quantity
            };
            Ok(FillResult {
                quantity,
                avg_price: price,
            })
        }

        fn current_price(&self, instrument: &str) -> Result<Option<f64>, RebounderError> {
            Ok(self.prices.lock().unwrap().get(instrument).copied())
        }
    }

    #[derive(Default)]
    struct Memory {
        fail_append: AtomicBool,
        positions: Mutex<BTreeMap<PositionId, Position>>,
        trades: Mutex<Vec<ClosedTrade>>,
    }

    impl StatePort for Memory {
        fn save_position(&self, position: &Position) -> Result<(), RebounderError> {
            self.positions.lock().unwrap().insert(position.id, position.clone());
            Ok(())
        }
        fn remove_position(&self, id: PositionId) -> Result<(), RebounderError> {
            self.positions.lock().unwrap().remove(&id);
            Ok(())
        }
        fn load_positions(&self) -> Result<Vec<Position>, RebounderError> {
            Ok(self.positions.lock().unwrap().values().cloned().collect())
        }
        fn append_trade(&self, trade: &ClosedTrade) -> Result<(), RebounderError> {
            if self.fail_append.load(Ordering::SeqCst) {
                return Err(RebounderError::Database {
                    reason: "disk I/O error".into(),
                });
            }
            let mut trades = self.trades.lock().unwrap();
            if !trades.iter().any(|t| t.id == trade.id) {
                trades.push(trade.clone());
            }
            Ok(())
        }
        fn load_trades(&self) -> Result<Vec<ClosedTrade>, RebounderError> {
            Ok(self.trades.lock().unwrap().clone())
        }
        fn save_global_policy(&self, _: &ExitPolicy) -> Result<(), RebounderError> {
            Ok(())
        }
        fn load_global_policy(&self) -> Result<Option<ExitPolicy>, RebounderError> {
            Ok(None)
        }
    }

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 4, day)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn crash(instrument: &str, probability: f64) -> CrashEvent {
        CrashEvent {
            instrument: instrument.into(),
            date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            close: 100.0,
            crash_pct: -12.0,
            volume: 5_000_000,
            forward: vec![ForwardPeriod {
                ret: 0.0,
                high: 100.0,
                low: 100.0,
            }],
            rebound_probability: Some(probability),
        }
    }

    fn config() -> ManagerConfig {
        ManagerConfig {
            total_capital: 300_000.0,
            per_trade_cap: 100_000.0,
            max_positions: 3,
            initial_fraction: 0.5,
            min_probability: 0.6,
            fill_timeout: Duration::from_millis(100),
        }
    }

    fn manager() -> (PositionManager, Arc<Broker>, Arc<Memory>) {
        let broker = Arc::new(Broker::default());
        let memory = Arc::new(Memory::default());
        let mgr = PositionManager::new(config(), broker.clone(), memory.clone()).unwrap();
        (mgr, broker, memory)
    }

    #[test]
    fn open_commits_first_tranche() {
        let (mgr, _, memory) = manager();
        let pos = mgr.open(&crash("A", 0.7), &DEFAULT_POLICY, at(1)).unwrap();
        assert_eq!(pos.state(), PositionState::Entered);
        assert_eq!(pos.quantity, 500);
        assert_relative_eq!(pos.committed, 50_000.0);
        assert_relative_eq!(pos.planned_capital, 100_000.0);
        assert_relative_eq!(mgr.ledger().committed(), 50_000.0);
        assert_eq!(memory.positions.lock().unwrap().len(), 1);
        mgr.check_invariants().unwrap();
    }

    #[test]
    fn below_threshold_is_rejected() {
        let (mgr, _, _) = manager();
        let err = mgr.open(&crash("A", 0.5), &DEFAULT_POLICY, at(1)).unwrap_err();
        assert!(matches!(
            err,
            RebounderError::EntryRejected {
                reason: RejectReason::BelowThreshold { .. },
                ..
            }
        ));
        assert_eq!(mgr.ledger().open_positions(), 0);
    }

    #[test]
    fn cap_rejection_leaves_ledger_untouched() {
        let (mgr, _, _) = manager();
        for name in ["A", "B", "C"] {
            mgr.open(&crash(name, 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        }
        let before = mgr.ledger();
        let err = mgr.open(&crash("D", 0.9), &DEFAULT_POLICY, at(1)).unwrap_err();
        assert!(matches!(
            err,
            RebounderError::EntryRejected {
                reason: RejectReason::ConcurrencyCap { open: 3, cap: 3 },
                ..
            }
        ));
        assert_eq!(mgr.ledger(), before);
    }

    #[test]
    fn duplicate_instrument_is_an_invariant_violation() {
        let (mgr, _, _) = manager();
        mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        let err = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap_err();
        assert!(matches!(err, RebounderError::InvariantViolation { .. }));
    }

    #[test]
    fn unaffordable_unit_is_rejected() {
        let (mgr, _, _) = manager();
        let mut event = crash("A", 0.9);
        event.close = 60_000.0;
        let err = mgr.open(&event, &DEFAULT_POLICY, at(1)).unwrap_err();
        assert!(matches!(
            err,
            RebounderError::EntryRejected {
                reason: RejectReason::InsufficientCapital { .. },
                ..
            }
        ));
        assert_eq!(mgr.ledger().committed(), 0.0);
    }

    #[test]
    fn failed_entry_releases_reservation() {
        let (mgr, broker, memory) = manager();
        broker.fail.store(true, Ordering::SeqCst);
        let err = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap_err();
        assert!(matches!(err, RebounderError::Collaborator { .. }));
        assert_eq!(mgr.ledger().open_positions(), 0);
        assert_eq!(mgr.ledger().committed(), 0.0);
        assert!(mgr.open_positions().is_empty());
        assert!(memory.positions.lock().unwrap().is_empty());
    }

    #[test]
    fn target_exit_closes_and_records_once() {
        let (mgr, broker, memory) = manager();
        let pos = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        broker.set_price("A", 108.0);
        let Evaluation::Closed(trade) = mgr.evaluate(pos.id, 108.0, at(2)).unwrap() else {
            panic!("expected a close");
        };
        assert_eq!(trade.reason, ExitReason::TargetProfit);
        assert_relative_eq!(trade.pnl, 4_000.0, epsilon = 1e-6);
        assert_eq!(mgr.ledger().open_positions(), 0);
        assert_relative_eq!(mgr.ledger().committed(), 0.0);
        assert_relative_eq!(mgr.ledger().realized_pnl(), 4_000.0, epsilon = 1e-6);
        assert_eq!(memory.trades.lock().unwrap().len(), 1);
        assert!(memory.positions.lock().unwrap().is_empty());

        let again = mgr.evaluate(pos.id, 108.0, at(3)).unwrap_err();
        assert!(matches!(again, RebounderError::InvariantViolation { .. }));
        assert!(matches!(
            mgr.evaluate(999, 100.0, at(3)),
            Err(RebounderError::PositionNotFound { id: 999 })
        ));
    }

    #[test]
    fn stop_exit() {
        let (mgr, broker, _) = manager();
        let pos = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        broker.set_price("A", 95.0);
        let Evaluation::Closed(trade) = mgr.evaluate(pos.id, 95.0, at(2)).unwrap() else {
            panic!("expected a close");
        };
        assert_eq!(trade.reason, ExitReason::StopLoss);
    }

    #[test]
    fn quote_crossing_both_thresholds_takes_profit() {
        let (mgr, broker, _) = manager();
        let pos = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        broker.set_price("A", 100.0);
        let quote = Quote {
            last: 100.0,
            high: 110.0,
            low: 90.0,
        };
        let Evaluation::Closed(trade) = mgr.evaluate_quote(pos.id, quote, at(2)).unwrap() else {
            panic!("expected a close");
        };
        assert_eq!(trade.reason, ExitReason::TargetProfit);
    }

    #[test]
    fn horizon_expiry_after_holding_period() {
        let (mgr, _, _) = manager();
        let pos = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        assert_eq!(mgr.evaluate(pos.id, 101.0, at(5)).unwrap(), Evaluation::Hold);
        let Evaluation::Closed(trade) = mgr.evaluate(pos.id, 101.0, at(6)).unwrap() else {
            panic!("expected a close");
        };
        assert_eq!(trade.reason, ExitReason::HorizonExpiry);
    }

    #[test]
    fn averaging_recomputes_entry_once() {
        let (mgr, broker, _) = manager();
        let pos = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        broker.set_price("A", 97.0);
        let Evaluation::Averaged(avg) = mgr.evaluate(pos.id, 97.0, at(2)).unwrap() else {
            panic!("expected averaging");
        };
        assert_eq!(avg.state(), PositionState::Averaged);
        // 50_000 remaining / 97 → 515 units
        assert_eq!(avg.quantity, 1015);
        let expected = (500.0 * 100.0 + 515.0 * 97.0) / 1015.0;
        assert_relative_eq!(avg.entry_price, expected, epsilon = 1e-9);
        assert_relative_eq!(avg.committed, 50_000.0 + 515.0 * 97.0, epsilon = 1e-6);
        mgr.check_invariants().unwrap();

        // Still below the trigger, but averaging is spent.
        assert_eq!(mgr.evaluate(pos.id, 97.5, at(3)).unwrap(), Evaluation::Hold);
    }

    #[test]
    fn timed_out_entry_requires_reconciliation() {
        let (mgr, broker, _) = manager();
        broker.stall.store(true, Ordering::SeqCst);
        let err = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap_err();
        assert!(matches!(err, RebounderError::FillTimeout { .. }));
        let pos = mgr.open_positions().pop().unwrap();
        assert_eq!(pos.state(), PositionState::PendingEntry);
        assert!(pos.needs_reconciliation());
        assert_relative_eq!(mgr.ledger().committed(), 50_000.0);

        assert!(matches!(
            mgr.evaluate(pos.id, 100.0, at(2)),
            Err(RebounderError::ReconciliationRequired { .. })
        ));

        let Reconciled::Open(entered) = mgr
            .reconcile(
                pos.id,
                Resolution::Filled {
                    quantity: 500,
                    avg_price: 99.0,
                },
                at(2),
            )
            .unwrap()
        else {
            panic!("expected an open position");
        };
        assert_eq!(entered.state(), PositionState::Entered);
        assert_relative_eq!(mgr.ledger().committed(), 49_500.0);
        mgr.check_invariants().unwrap();
    }

    #[test]
    fn unfilled_entry_reconciles_to_abandoned() {
        let (mgr, broker, _) = manager();
        broker.stall.store(true, Ordering::SeqCst);
        let _ = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1));
        let id = mgr.open_positions()[0].id;
        assert_eq!(
            mgr.reconcile(id, Resolution::NotFilled, at(2)).unwrap(),
            Reconciled::Abandoned
        );
        assert_eq!(mgr.ledger().open_positions(), 0);
        assert_eq!(mgr.ledger().committed(), 0.0);
    }

    #[test]
    fn failed_exit_leaves_position_unchanged() {
        let (mgr, broker, _) = manager();
        let pos = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        broker.fail.store(true, Ordering::SeqCst);
        assert!(mgr.evaluate(pos.id, 110.0, at(2)).is_err());
        assert_eq!(mgr.position(pos.id).unwrap(), pos);
        assert_eq!(mgr.ledger().open_positions(), 1);
    }

    #[test]
    fn partial_exit_reconciles_the_units_sold() {
        let (mgr, broker, memory) = manager();
        let pos = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        broker.set_price("A", 110.0);
        broker.partial.store(true, Ordering::SeqCst);
        assert!(mgr.evaluate(pos.id, 110.0, at(2)).is_err());
        assert!(mgr.position(pos.id).unwrap().needs_reconciliation());

        let oversold = Resolution::Filled {
            quantity: 501,
            avg_price: 110.0,
        };
        assert!(matches!(
            mgr.reconcile(pos.id, oversold, at(3)),
            Err(RebounderError::InvalidInput { .. })
        ));

        let Reconciled::Open(rest) = mgr
            .reconcile(
                pos.id,
                Resolution::Filled {
                    quantity: 499,
                    avg_price: 110.0,
                },
                at(3),
            )
            .unwrap()
        else {
            panic!("expected the remainder to stay open");
        };
        assert_eq!(rest.quantity, 1);
        assert!(!rest.needs_reconciliation());
        assert_relative_eq!(rest.committed, 100.0, epsilon = 1e-6);
        assert_relative_eq!(rest.realized_pnl, 4_990.0, epsilon = 1e-6);
        assert_relative_eq!(mgr.ledger().committed(), 100.0, epsilon = 1e-6);
        assert_relative_eq!(mgr.ledger().realized_pnl(), 4_990.0, epsilon = 1e-6);
        assert_eq!(mgr.ledger().open_positions(), 1);
        assert_eq!(memory.positions.lock().unwrap()[&pos.id].quantity, 1);
        mgr.check_invariants().unwrap();
        drop(mgr);

        let second = PositionManager::new(config(), broker.clone(), memory.clone()).unwrap();
        second.restore().unwrap();
        assert_relative_eq!(second.ledger().realized_pnl(), 4_990.0, epsilon = 1e-6);
        broker.partial.store(false, Ordering::SeqCst);
        let Evaluation::Closed(trade) = second.evaluate(pos.id, 110.0, at(4)).unwrap() else {
            panic!("expected the remainder to close");
        };
        assert_eq!(trade.quantity, 1);
        assert_relative_eq!(trade.pnl, 5_000.0, epsilon = 1e-6);
        assert_relative_eq!(second.ledger().realized_pnl(), 5_000.0, epsilon = 1e-6);
        assert_eq!(second.ledger().open_positions(), 0);
        second.check_invariants().unwrap();
    }

    #[test]
    fn unrecorded_close_stays_flagged_until_reconciled() {
        let (mgr, broker, memory) = manager();
        let pos = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        broker.set_price("A", 110.0);
        memory.fail_append.store(true, Ordering::SeqCst);
        let err = mgr.evaluate(pos.id, 110.0, at(2)).unwrap_err();
        assert!(matches!(
            err,
            RebounderError::Collaborator {
                collaborator: Collaborator::State,
                ..
            }
        ));

        let flagged = mgr.position(pos.id).unwrap();
        assert!(flagged.needs_reconciliation());
        assert_eq!(flagged.quantity, 500);
        assert_eq!(mgr.ledger().open_positions(), 1);
        assert!(memory.positions.lock().unwrap()[&pos.id].needs_reconciliation());
        assert!(memory.trades.lock().unwrap().is_empty());

        memory.fail_append.store(false, Ordering::SeqCst);
        let Reconciled::Closed(trade) = mgr
            .reconcile(
                pos.id,
                Resolution::Filled {
                    quantity: 500,
                    avg_price: 110.0,
                },
                at(3),
            )
            .unwrap()
        else {
            panic!("expected a close");
        };
        assert_eq!(trade.reason, ExitReason::TargetProfit);
        assert_relative_eq!(trade.pnl, 5_000.0, epsilon = 1e-6);
        assert_eq!(memory.trades.lock().unwrap().len(), 1);
        assert!(memory.positions.lock().unwrap().is_empty());
        assert_relative_eq!(mgr.ledger().realized_pnl(), 5_000.0, epsilon = 1e-6);
        mgr.check_invariants().unwrap();
    }

    #[test]
    fn slipped_entry_fill_needs_reconciliation() {
        let (mgr, broker, _) = manager();
        broker.set_price("A", 700.0);
        let err = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap_err();
        assert!(matches!(err, RebounderError::ReconciliationRequired { .. }));
        let pos = mgr.open_positions().pop().unwrap();
        assert_eq!(pos.state(), PositionState::PendingEntry);
        assert!(pos.needs_reconciliation());
        assert_relative_eq!(mgr.ledger().committed(), 50_000.0);
        mgr.check_invariants().unwrap();
    }

    #[test]
    fn scan_evaluates_at_current_prices() {
        let (mgr, broker, _) = manager();
        let a = mgr.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        let b = mgr.open(&crash("B", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        broker.set_price("A", 110.0);
        let report = mgr.scan(at(2));
        assert_eq!(report.evaluated.len(), 1);
        assert_eq!(report.evaluated[0].0, a.id);
        assert_eq!(report.unpriced, vec![b.id]);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn restore_rebuilds_ledger_and_skips_closed() {
        let broker = Arc::new(Broker::default());
        let memory = Arc::new(Memory::default());
        let first = PositionManager::new(config(), broker.clone(), memory.clone()).unwrap();
        let a = first.open(&crash("A", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        let b = first.open(&crash("B", 0.9), &DEFAULT_POLICY, at(1)).unwrap();
        broker.set_price("B", 110.0);
        first.evaluate(b.id, 110.0, at(2)).unwrap();
        drop(first);

        let second = PositionManager::new(config(), broker, memory).unwrap();
        assert_eq!(second.restore().unwrap(), 1);
        assert_eq!(second.open_positions()[0].id, a.id);
        assert_relative_eq!(second.ledger().committed(), 50_000.0);
        assert_relative_eq!(second.ledger().realized_pnl(), 5_000.0, epsilon = 1e-6);
        assert!(matches!(
            second.evaluate(b.id, 100.0, at(3)),
            Err(RebounderError::InvariantViolation { .. })
        ));
        let c = second.open(&crash("C", 0.9), &DEFAULT_POLICY, at(3)).unwrap();
        assert!(c.id > b.id);
        second.check_invariants().unwrap();
    }

    #[test]
    fn decide_precedence() {
        let mut pos = Position::pending_entry(1, "A", 100_000.0, 0.9, DEFAULT_POLICY, at(1));
        pos.apply_fill(10, 100.0);
        pos.transition(PositionState::Entered).unwrap();
        let both = Quote {
            last: 100.0,
            high: 120.0,
            low: 80.0,
        };
        assert_eq!(decide(&pos, both, at(2)), Decision::Exit(ExitReason::TargetProfit));
        assert_eq!(
            decide(&pos, Quote::last(94.0), at(9)),
            Decision::Exit(ExitReason::StopLoss)
        );
        assert_eq!(
            decide(&pos, Quote::last(97.0), at(6)),
            Decision::Exit(ExitReason::HorizonExpiry)
        );
        assert_eq!(decide(&pos, Quote::last(97.0), at(2)), Decision::Average);
        assert_eq!(decide(&pos, Quote::last(99.0), at(2)), Decision::Hold);
    }

    #[test]
    fn scoring_fills_in_missing_probability() {
        struct Fixed(f64);
        impl ScoringPort for Fixed {
            fn score(&self, _: &CrashEvent) -> Result<f64, RebounderError> {
                Ok(self.0)
            }
        }
        let mut event = crash("A", 0.0);
        event.rebound_probability = None;

        let (mgr, _, _) = manager();
        assert!(matches!(
            mgr.open(&event, &DEFAULT_POLICY, at(1)),
            Err(RebounderError::Collaborator { collaborator: Collaborator::Scoring, .. })
        ));

        let (mgr, _, _) = manager();
        let mgr = mgr.with_scoring(Arc::new(Fixed(1.5)));
        assert!(matches!(
            mgr.open(&event, &DEFAULT_POLICY, at(1)),
            Err(RebounderError::Collaborator { collaborator: Collaborator::Scoring, .. })
        ));

        let (mgr, _, _) = manager();
        let mgr = mgr.with_scoring(Arc::new(Fixed(0.8)));
        let pos = mgr.open(&event, &DEFAULT_POLICY, at(1)).unwrap();
        assert_relative_eq!(pos.probability, 0.8);
    }
}
