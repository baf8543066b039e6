//! Realized trade statistics over the trade history.

use serde::Serialize;

use super::position::ClosedTrade;
use super::simulator::ExitReason;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeSummary {
    pub trades: usize,
    pub trades_won: usize,
    pub trades_lost: usize,
    pub trades_breakeven: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    /// Total P&L over the account's total capital.
    pub return_on_capital: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_holding_days: f64,
    /// Deepest fall of realized equity from a prior peak, as a fraction.
    pub max_drawdown: f64,
    pub target_exits: usize,
    pub stop_exits: usize,
    pub horizon_exits: usize,
    pub averaged: usize,
}

impl TradeSummary {
    pub fn compute(trades: &[ClosedTrade], total_capital: f64) -> Self {
        let mut trades_won = 0usize;
        let mut trades_lost = 0usize;
        let mut trades_breakeven = 0usize;
        let mut total_wins = 0.0_f64;
        let mut total_losses = 0.0_f64;
        let mut largest_win = 0.0_f64;
        let mut largest_loss = 0.0_f64;
        let mut holding_days = 0i64;
        let mut target_exits = 0usize;
        let mut stop_exits = 0usize;
        let mut horizon_exits = 0usize;
        let mut averaged = 0usize;

        for trade in trades {
            let pnl = trade.pnl;
            if pnl > 0.0 {
                trades_won += 1;
                total_wins += pnl;
                largest_win = largest_win.max(pnl);
            } else if pnl < 0.0 {
                trades_lost += 1;
                total_losses += pnl.abs();
                largest_loss = largest_loss.max(pnl.abs());
            } else {
                trades_breakeven += 1;
            }
            holding_days += trade.holding_days();
            match trade.reason {
                ExitReason::TargetProfit => target_exits += 1,
                ExitReason::StopLoss => stop_exits += 1,
                ExitReason::HorizonExpiry => horizon_exits += 1,
            }
            if trade.averaged {
                averaged += 1;
            }
        }

        let n = trades.len();
        let ratio = |num: f64, den: usize| if den > 0 { num / den as f64 } else { 0.0 };
        let total_pnl = total_wins - total_losses;

        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        TradeSummary {
            trades: n,
            trades_won,
            trades_lost,
            trades_breakeven,
            win_rate: ratio(trades_won as f64, n),
            total_pnl,
            avg_pnl: ratio(total_pnl, n),
            return_on_capital: if total_capital > 0.0 {
                total_pnl / total_capital
            } else {
                0.0
            },
            profit_factor,
            avg_win: ratio(total_wins, trades_won),
            avg_loss: ratio(total_losses, trades_lost),
            largest_win,
            largest_loss,
            avg_holding_days: ratio(holding_days as f64, n),
            max_drawdown: realized_drawdown(trades, total_capital),
            target_exits,
            stop_exits,
            horizon_exits,
            averaged,
        }
    }
}

/// Drawdown of `capital + cumulative realized P&L`, trades taken in exit
/// order.
fn realized_drawdown(trades: &[ClosedTrade], capital: f64) -> f64 {
    let mut ordered: Vec<&ClosedTrade> = trades.iter().collect();
    ordered.sort_by_key(|t| (t.exit_time, t.id));

    let mut equity = capital;
    let mut peak = capital;
    let mut max_dd = 0.0_f64;
    for trade in ordered {
        equity += trade.pnl;
        if equity > peak {
            peak = equity;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak);
        }
    }
    max_dd
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn make_trade(id: u64, pnl: f64, days: i64, reason: ExitReason) -> ClosedTrade {
        let entry_time = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
            + Duration::days(id as i64);
        ClosedTrade {
            id,
            instrument: format!("I{id}"),
            quantity: 100,
            entry_price: 100.0,
            exit_price: 100.0 + pnl / 100.0,
            capital: 10_000.0,
            entry_time,
            exit_time: entry_time + Duration::days(days),
            reason,
            pnl,
            exit_return: pnl / 10_000.0,
            averaged: false,
        }
    }

    #[test]
    fn summary_empty() {
        let s = TradeSummary::compute(&[], 100_000.0);
        assert_eq!(s.trades, 0);
        assert!((s.win_rate - 0.0).abs() < f64::EPSILON);
        assert!((s.profit_factor - 0.0).abs() < f64::EPSILON);
        assert!((s.max_drawdown - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_wins_losses_and_reasons() {
        let trades = vec![
            make_trade(1, 800.0, 2, ExitReason::TargetProfit),
            make_trade(2, -500.0, 1, ExitReason::StopLoss),
            make_trade(3, 0.0, 5, ExitReason::HorizonExpiry),
            make_trade(4, 200.0, 4, ExitReason::HorizonExpiry),
        ];
        let s = TradeSummary::compute(&trades, 100_000.0);
        assert_eq!(s.trades_won, 2);
        assert_eq!(s.trades_lost, 1);
        assert_eq!(s.trades_breakeven, 1);
        assert!((s.win_rate - 0.5).abs() < f64::EPSILON);
        assert!((s.total_pnl - 500.0).abs() < 1e-9);
        assert!((s.avg_pnl - 125.0).abs() < 1e-9);
        assert!((s.return_on_capital - 0.005).abs() < 1e-12);
        assert!((s.profit_factor - 2.0).abs() < 1e-9);
        assert!((s.avg_win - 500.0).abs() < 1e-9);
        assert!((s.avg_loss - 500.0).abs() < 1e-9);
        assert!((s.largest_win - 800.0).abs() < 1e-9);
        assert!((s.largest_loss - 500.0).abs() < 1e-9);
        assert!((s.avg_holding_days - 3.0).abs() < 1e-9);
        assert_eq!(
            (s.target_exits, s.stop_exits, s.horizon_exits),
            (1, 1, 2)
        );
    }

    #[test]
    fn summary_profit_factor_without_losses() {
        let trades = vec![make_trade(1, 100.0, 1, ExitReason::TargetProfit)];
        let s = TradeSummary::compute(&trades, 100_000.0);
        assert!(s.profit_factor.is_infinite());
    }

    #[test]
    fn summary_drawdown_follows_exit_order() {
        // Exits: +1000 (day 2), -2000 (day 3), -1000 (day 4), +500 (day 5)
        let trades = vec![
            make_trade(4, 500.0, 1, ExitReason::HorizonExpiry),
            make_trade(1, 1_000.0, 1, ExitReason::TargetProfit),
            make_trade(3, -1_000.0, 1, ExitReason::StopLoss),
            make_trade(2, -2_000.0, 1, ExitReason::StopLoss),
        ];
        let s = TradeSummary::compute(&trades, 10_000.0);
        assert!((s.max_drawdown - 3_000.0 / 11_000.0).abs() < 1e-12);
    }

    #[test]
    fn summary_counts_averaged_trades() {
        let mut t = make_trade(1, 100.0, 1, ExitReason::TargetProfit);
        t.averaged = true;
        let s = TradeSummary::compute(&[t, make_trade(2, 1.0, 1, ExitReason::HorizonExpiry)], 1.0);
        assert_eq!(s.averaged, 1);
    }
}
