//! Markdown report adapter implementing ReportPort.
//!
//! Renders a calibration run as plain Markdown tables: the selected policy,
//! the population filter counts, the ranked grid, and optionally the
//! allocation and capital-level comparisons.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::domain::calibrator::{
    AllocationComparison, AllocationStats, Calibration, CapitalLevelResult, PopulationStats,
};
use crate::domain::error::RebounderError;
use crate::domain::summary::TradeSummary;
use crate::ports::report_port::{CalibrationReport, ReportPort};

/// How many grid cells the ranked table shows.
const RANKED_ROWS: usize = 10;

pub struct MarkdownReportAdapter;

impl MarkdownReportAdapter {
    pub fn new() -> Self {
        Self
    }

    pub fn render(&self, report: &CalibrationReport<'_>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Crash-rebound calibration\n");
        let _ = writeln!(
            out,
            "Generated {} from crash events {} to {}.\n",
            report.generated, report.period.0, report.period.1
        );
        out.push_str(&render_best(report.calibration));
        out.push_str(&render_population(&report.calibration.population));
        out.push_str(&render_ranked(report.calibration));
        if let Some(allocation) = report.allocation {
            out.push_str(&render_allocation(allocation));
        }
        if !report.capital_levels.is_empty() {
            out.push_str(&render_capital_levels(report.capital_levels));
        }
        out
    }
}

impl Default for MarkdownReportAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportPort for MarkdownReportAdapter {
    fn write(&self, report: &CalibrationReport<'_>, output_path: &str) -> Result<(), RebounderError> {
        let markdown = self.render(report);
        let path = Path::new(output_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, markdown)?;
        Ok(())
    }
}

fn pct(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

fn money(value: f64) -> String {
    format!("{value:.0}")
}

fn render_best(calibration: &Calibration) -> String {
    let mut out = String::from("## Selected policy\n\n");
    let _ = writeln!(out, "{}\n", calibration.best);
    if let Some(cell) = calibration.best_cell() {
        let _ = writeln!(
            out,
            "{} trades, win rate {}, mean return {}, total return {}, mean holding {:.1} periods.\n",
            cell.trades,
            pct(cell.win_rate),
            pct(cell.mean_return),
            pct(cell.total_return),
            cell.mean_holding
        );
    }
    out
}

fn render_population(population: &PopulationStats) -> String {
    let mut out = String::from("## Population\n\n");
    out.push_str("| Total | Accepted | Below threshold | Illiquid | Unusable |\n");
    out.push_str("|---:|---:|---:|---:|---:|\n");
    let _ = writeln!(
        out,
        "| {} | {} | {} | {} | {} |\n",
        population.total,
        population.accepted,
        population.below_threshold,
        population.illiquid,
        population.unusable
    );
    out
}

fn render_ranked(calibration: &Calibration) -> String {
    let mut out = String::from("## Grid ranking\n\n");
    out.push_str("| # | Target | Stop | Trades | Win rate | Mean | Total | Holding | TP / SL / H |\n");
    out.push_str("|---:|---:|---:|---:|---:|---:|---:|---:|:---:|\n");
    for (rank, cell) in calibration.ranked.iter().take(RANKED_ROWS).enumerate() {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} | {} | {:.1} | {} / {} / {} |",
            rank + 1,
            pct(cell.take_profit),
            pct(cell.stop_loss),
            cell.trades,
            pct(cell.win_rate),
            pct(cell.mean_return),
            pct(cell.total_return),
            cell.mean_holding,
            cell.target_exits,
            cell.stop_exits,
            cell.horizon_exits
        );
    }
    if calibration.ranked.len() > RANKED_ROWS {
        let _ = writeln!(
            out,
            "\n_{} more cells not shown._",
            calibration.ranked.len() - RANKED_ROWS
        );
    }
    out.push('\n');
    out
}

fn allocation_row(stats: &AllocationStats) -> String {
    format!(
        "| {} | {} | {} | {} | {} | {} | {} |\n",
        stats.strategy,
        stats.trades,
        pct(stats.win_rate),
        money(stats.total_profit),
        money(stats.invested),
        pct(stats.return_rate),
        stats.averaging_count
    )
}

fn render_allocation(comparison: &AllocationComparison) -> String {
    let mut out = String::from("## Allocation\n\n");
    out.push_str("| Strategy | Trades | Win rate | Profit | Invested | Return | Averaged |\n");
    out.push_str("|---|---:|---:|---:|---:|---:|---:|\n");
    out.push_str(&allocation_row(&comparison.full_commit));
    out.push_str(&allocation_row(&comparison.split_averaging));
    let _ = writeln!(out, "\nRecommended: **{}**.\n", comparison.recommendation);
    out
}

fn render_capital_levels(levels: &[CapitalLevelResult]) -> String {
    let mut out = String::from("## Capital levels\n\n");
    out.push_str("| Account | Per trade | Trades | Illiquid | Wins | Profit | Return |\n");
    out.push_str("|---:|---:|---:|---:|---:|---:|---:|\n");
    for level in levels {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} | {} |",
            money(level.account_size),
            money(level.per_trade_capital),
            level.trades,
            level.illiquid,
            level.wins,
            money(level.total_profit),
            pct(level.return_rate)
        );
    }
    out.push('\n');
    out
}

/// Realized trade statistics as a Markdown table.
pub fn render_trade_summary(summary: &TradeSummary) -> String {
    let mut out = String::from("| Metric | Value |\n|---|---:|\n");
    let mut row = |name: &str, value: String| {
        let _ = writeln!(out, "| {name} | {value} |");
    };
    row("Trades", summary.trades.to_string());
    row(
        "Won / lost / flat",
        format!(
            "{} / {} / {}",
            summary.trades_won, summary.trades_lost, summary.trades_breakeven
        ),
    );
    row("Win rate", pct(summary.win_rate));
    row("Total P&L", money(summary.total_pnl));
    row("Average P&L", money(summary.avg_pnl));
    row("Return on capital", pct(summary.return_on_capital));
    row(
        "Profit factor",
        if summary.profit_factor.is_infinite() {
            "inf".to_string()
        } else {
            format!("{:.2}", summary.profit_factor)
        },
    );
    row("Largest win", money(summary.largest_win));
    row("Largest loss", money(summary.largest_loss));
    row("Average holding", format!("{:.1} days", summary.avg_holding_days));
    row("Max drawdown", pct(summary.max_drawdown));
    row(
        "Exits TP / SL / horizon",
        format!(
            "{} / {} / {}",
            summary.target_exits, summary.stop_exits, summary.horizon_exits
        ),
    );
    row("Averaged", summary.averaged.to_string());
    out
}
