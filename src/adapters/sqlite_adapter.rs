//! SQLite adapter: crash-event history and persisted lifecycle state.

use crate::domain::crash_event::{CrashEvent, ForwardPeriod};
use crate::domain::error::RebounderError;
use crate::domain::policy::ExitPolicy;
use crate::domain::simulator::ExitReason;
use crate::domain::position::{
    ClosedTrade, OrderPurpose, PendingOrder, Position, PositionId, PositionState,
};
use crate::ports::config_port::ConfigPort;
use crate::ports::history_port::HistoryPort;
use crate::ports::state_port::StatePort;
use chrono::{NaiveDate, NaiveDateTime};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS crash_events (
    instrument TEXT NOT NULL,
    date TEXT NOT NULL,
    close REAL NOT NULL,
    crash_pct REAL NOT NULL,
    volume INTEGER NOT NULL,
    rebound_probability REAL,
    PRIMARY KEY (instrument, date)
);
CREATE INDEX IF NOT EXISTS idx_crash_events_date ON crash_events(date);
CREATE TABLE IF NOT EXISTS forward_periods (
    instrument TEXT NOT NULL,
    date TEXT NOT NULL,
    period INTEGER NOT NULL,
    ret REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    PRIMARY KEY (instrument, date, period)
);
CREATE TABLE IF NOT EXISTS open_positions (
    id INTEGER PRIMARY KEY,
    instrument TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL,
    entry_price REAL NOT NULL,
    quantity INTEGER NOT NULL,
    committed REAL NOT NULL,
    planned_capital REAL NOT NULL,
    averaged INTEGER NOT NULL,
    realized_pnl REAL NOT NULL DEFAULT 0,
    entry_time TEXT NOT NULL,
    probability REAL NOT NULL,
    target_profit REAL NOT NULL,
    stop_loss REAL NOT NULL,
    averaging_trigger REAL,
    horizon INTEGER NOT NULL,
    pending_purpose TEXT,
    pending_quantity INTEGER,
    pending_reference_price REAL,
    pending_reserved REAL,
    pending_requested_at TEXT
);
CREATE TABLE IF NOT EXISTS trade_history (
    id INTEGER PRIMARY KEY,
    instrument TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL NOT NULL,
    capital REAL NOT NULL,
    entry_time TEXT NOT NULL,
    exit_time TEXT NOT NULL,
    reason TEXT NOT NULL,
    pnl REAL NOT NULL,
    exit_return REAL NOT NULL,
    averaged INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS global_policy (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    target_profit REAL NOT NULL,
    stop_loss REAL NOT NULL,
    averaging_trigger REAL,
    horizon INTEGER NOT NULL
);";

const EVENT_COLUMNS: &str = "e.instrument, e.date, e.close, e.crash_pct, e.volume,
    e.rebound_probability, f.period, f.ret, f.high, f.low";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, RebounderError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| RebounderError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;
        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;
        Self::open(&db_path, pool_size)
    }

    pub fn open(path: &str, pool_size: u32) -> Result<Self, RebounderError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_error)?;
        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    /// Single-connection in-memory database; each pooled connection to
    /// `:memory:` would otherwise see its own empty database.
    pub fn in_memory() -> Result<Self, RebounderError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_error)?;
        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    pub fn initialize_schema(&self) -> Result<(), RebounderError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_error)
    }

    /// Insert or replace crash events with their forward windows. Returns
    /// the number written.
    pub fn insert_events(&self, events: &[CrashEvent]) -> Result<usize, RebounderError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_error)?;
        for event in events {
            let date = event.date.format(DATE_FORMAT).to_string();
            tx.execute(
                "INSERT OR REPLACE INTO crash_events
                 (instrument, date, close, crash_pct, volume, rebound_probability)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.instrument,
                    date,
                    event.close,
                    event.crash_pct,
                    event.volume,
                    event.rebound_probability
                ],
            )
            .map_err(query_error)?;
            tx.execute(
                "DELETE FROM forward_periods WHERE instrument = ?1 AND date = ?2",
                params![event.instrument, date],
            )
            .map_err(query_error)?;
            for (i, period) in event.forward.iter().enumerate() {
                tx.execute(
                    "INSERT INTO forward_periods (instrument, date, period, ret, high, low)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        event.instrument,
                        date,
                        (i + 1) as i64,
                        period.ret,
                        period.high,
                        period.low
                    ],
                )
                .map_err(query_error)?;
            }
        }
        tx.commit().map_err(query_error)?;
        Ok(events.len())
    }

    pub fn event_count(&self) -> Result<usize, RebounderError> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM crash_events", [], |row| row.get(0))
            .map_err(query_error)?;
        Ok(count as usize)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, RebounderError> {
        self.pool.get().map_err(pool_error)
    }

    fn query_events(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<CrashEvent>, RebounderError> {
        let conn = self.conn()?;
        let query = format!(
            "SELECT {EVENT_COLUMNS}
             FROM crash_events e
             LEFT JOIN forward_periods f ON f.instrument = e.instrument AND f.date = e.date
             WHERE {filter}
             ORDER BY e.instrument, e.date, f.period"
        );
        let mut stmt = conn.prepare(&query).map_err(query_error)?;
        let rows = stmt
            .query_map(args, |row| {
                let event = CrashEvent {
                    instrument: row.get(0)?,
                    date: parse_date(row, 1)?,
                    close: row.get(2)?,
                    crash_pct: row.get(3)?,
                    volume: row.get(4)?,
                    forward: Vec::new(),
                    rebound_probability: row.get(5)?,
                };
                let period: Option<ForwardPeriod> = match row.get::<_, Option<i64>>(6)? {
                    Some(_) => Some(ForwardPeriod {
                        ret: row.get(7)?,
                        high: row.get(8)?,
                        low: row.get(9)?,
                    }),
                    None => None,
                };
                Ok((event, period))
            })
            .map_err(query_error)?;

        let mut events: Vec<CrashEvent> = Vec::new();
        for row in rows {
            let (event, period) = row.map_err(query_error)?;
            let same = events
                .last()
                .is_some_and(|last| last.instrument == event.instrument && last.date == event.date);
            if !same {
                events.push(event);
            }
            if let (Some(period), Some(last)) = (period, events.last_mut()) {
                last.forward.push(period);
            }
        }
        Ok(events)
    }
}

impl HistoryPort for SqliteAdapter {
    fn crash_events(
        &self,
        instrument: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CrashEvent>, RebounderError> {
        let start = start.format(DATE_FORMAT).to_string();
        let end = end.format(DATE_FORMAT).to_string();
        self.query_events(
            "e.instrument = ?1 AND e.date >= ?2 AND e.date <= ?3",
            &[&instrument, &start, &end],
        )
    }

    fn crash_events_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CrashEvent>, RebounderError> {
        let start = start.format(DATE_FORMAT).to_string();
        let end = end.format(DATE_FORMAT).to_string();
        self.query_events("e.date >= ?1 AND e.date <= ?2", &[&start, &end])
    }

    fn list_instruments(&self) -> Result<Vec<String>, RebounderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT instrument FROM crash_events ORDER BY instrument")
            .map_err(query_error)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(query_error)?;
        let mut instruments = Vec::new();
        for row in rows {
            instruments.push(row.map_err(query_error)?);
        }
        Ok(instruments)
    }
}

impl StatePort for SqliteAdapter {
    fn save_position(&self, position: &Position) -> Result<(), RebounderError> {
        let pending = position.pending.as_ref();
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO open_positions
                 (id, instrument, state, entry_price, quantity, committed, planned_capital,
                  averaged, entry_time, probability, target_profit, stop_loss,
                  averaging_trigger, horizon, pending_purpose, pending_quantity,
                  pending_reference_price, pending_reserved, pending_requested_at,
                  realized_pnl)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16, ?17, ?18, ?19, ?20)",
                params![
                    position.id as i64,
                    position.instrument,
                    position.state().as_str(),
                    position.entry_price,
                    position.quantity,
                    position.committed,
                    position.planned_capital,
                    position.averaged,
                    position.entry_time.format(TIMESTAMP_FORMAT).to_string(),
                    position.probability,
                    position.policy.target_profit(),
                    position.policy.stop_loss(),
                    position.policy.averaging_trigger(),
                    position.policy.horizon() as i64,
                    pending.map(|o| o.purpose.encode()),
                    pending.map(|o| o.quantity),
                    pending.map(|o| o.reference_price),
                    pending.map(|o| o.reserved),
                    pending.map(|o| o.requested_at.format(TIMESTAMP_FORMAT).to_string()),
                    position.realized_pnl,
                ],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn remove_position(&self, id: PositionId) -> Result<(), RebounderError> {
        self.conn()?
            .execute("DELETE FROM open_positions WHERE id = ?1", params![id as i64])
            .map_err(query_error)?;
        Ok(())
    }

    fn load_positions(&self) -> Result<Vec<Position>, RebounderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, instrument, state, entry_price, quantity, committed, planned_capital,
                        averaged, entry_time, probability, target_profit, stop_loss,
                        averaging_trigger, horizon, pending_purpose, pending_quantity,
                        pending_reference_price, pending_reserved, pending_requested_at,
                        realized_pnl
                 FROM open_positions ORDER BY id",
            )
            .map_err(query_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PositionRow {
                    id: row.get::<_, i64>(0)? as PositionId,
                    instrument: row.get(1)?,
                    state: row.get(2)?,
                    entry_price: row.get(3)?,
                    quantity: row.get(4)?,
                    committed: row.get(5)?,
                    planned_capital: row.get(6)?,
                    averaged: row.get(7)?,
                    entry_time: parse_timestamp(row, 8)?,
                    probability: row.get(9)?,
                    target_profit: row.get(10)?,
                    stop_loss: row.get(11)?,
                    averaging_trigger: row.get(12)?,
                    horizon: row.get(13)?,
                    pending_purpose: row.get(14)?,
                    pending_quantity: row.get(15)?,
                    pending_reference_price: row.get(16)?,
                    pending_reserved: row.get(17)?,
                    pending_requested_at: match row.get::<_, Option<String>>(18)? {
                        Some(_) => Some(parse_timestamp(row, 18)?),
                        None => None,
                    },
                    realized_pnl: row.get(19)?,
                })
            })
            .map_err(query_error)?;

        let mut positions = Vec::new();
        for row in rows {
            positions.push(row.map_err(query_error)?.into_position()?);
        }
        Ok(positions)
    }

    fn append_trade(&self, trade: &ClosedTrade) -> Result<(), RebounderError> {
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO trade_history
                 (id, instrument, quantity, entry_price, exit_price, capital, entry_time,
                  exit_time, reason, pnl, exit_return, averaged)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    trade.id as i64,
                    trade.instrument,
                    trade.quantity,
                    trade.entry_price,
                    trade.exit_price,
                    trade.capital,
                    trade.entry_time.format(TIMESTAMP_FORMAT).to_string(),
                    trade.exit_time.format(TIMESTAMP_FORMAT).to_string(),
                    trade.reason.as_str(),
                    trade.pnl,
                    trade.exit_return,
                    trade.averaged,
                ],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn load_trades(&self) -> Result<Vec<ClosedTrade>, RebounderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, instrument, quantity, entry_price, exit_price, capital, entry_time,
                        exit_time, reason, pnl, exit_return, averaged
                 FROM trade_history ORDER BY exit_time, id",
            )
            .map_err(query_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ClosedTrade {
                    id: row.get::<_, i64>(0)? as PositionId,
                    instrument: row.get(1)?,
                    quantity: row.get(2)?,
                    entry_price: row.get(3)?,
                    exit_price: row.get(4)?,
                    capital: row.get(5)?,
                    entry_time: parse_timestamp(row, 6)?,
                    exit_time: parse_timestamp(row, 7)?,
                    reason: parse_reason(row, 8)?,
                    pnl: row.get(9)?,
                    exit_return: row.get(10)?,
                    averaged: row.get(11)?,
                })
            })
            .map_err(query_error)?;

        let mut trades = Vec::new();
        for row in rows {
            trades.push(row.map_err(query_error)?);
        }
        Ok(trades)
    }

    fn save_global_policy(&self, policy: &ExitPolicy) -> Result<(), RebounderError> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO global_policy
                 (id, target_profit, stop_loss, averaging_trigger, horizon)
                 VALUES (1, ?1, ?2, ?3, ?4)",
                params![
                    policy.target_profit(),
                    policy.stop_loss(),
                    policy.averaging_trigger(),
                    policy.horizon() as i64
                ],
            )
            .map_err(query_error)?;
        Ok(())
    }

    fn load_global_policy(&self) -> Result<Option<ExitPolicy>, RebounderError> {
        let row: Option<(f64, f64, Option<f64>, i64)> = self
            .conn()?
            .query_row(
                "SELECT target_profit, stop_loss, averaging_trigger, horizon
                 FROM global_policy WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(query_error)?;
        match row {
            Some((target, stop, averaging, horizon)) => Ok(Some(ExitPolicy::new(
                target,
                stop,
                averaging,
                horizon.max(0) as usize,
            )?)),
            None => Ok(None),
        }
    }
}

struct PositionRow {
    id: PositionId,
    instrument: String,
    state: String,
    entry_price: f64,
    quantity: i64,
    committed: f64,
    planned_capital: f64,
    averaged: bool,
    entry_time: NaiveDateTime,
    probability: f64,
    target_profit: f64,
    stop_loss: f64,
    averaging_trigger: Option<f64>,
    horizon: i64,
    pending_purpose: Option<String>,
    pending_quantity: Option<i64>,
    pending_reference_price: Option<f64>,
    pending_reserved: Option<f64>,
    pending_requested_at: Option<NaiveDateTime>,
    realized_pnl: f64,
}

impl PositionRow {
    fn into_position(self) -> Result<Position, RebounderError> {
        let policy = ExitPolicy::new(
            self.target_profit,
            self.stop_loss,
            self.averaging_trigger,
            self.horizon.max(0) as usize,
        )?;
        let state: PositionState = self.state.parse()?;
        let mut position = Position::pending_entry(
            self.id,
            &self.instrument,
            self.planned_capital,
            self.probability,
            policy,
            self.entry_time,
        )
        .with_state(state)?;
        position.entry_price = self.entry_price;
        position.quantity = self.quantity;
        position.committed = self.committed;
        position.averaged = self.averaged;
        position.realized_pnl = self.realized_pnl;
        position.pending = match self.pending_purpose {
            Some(purpose) => Some(PendingOrder {
                purpose: OrderPurpose::decode(&purpose)?,
                quantity: self.pending_quantity.unwrap_or(0),
                reference_price: self.pending_reference_price.unwrap_or(0.0),
                reserved: self.pending_reserved.unwrap_or(0.0),
                requested_at: self.pending_requested_at.unwrap_or(self.entry_time),
            }),
            None => None,
        };
        Ok(position)
    }
}

fn parse_date(row: &Row<'_>, index: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(index)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(index)?;
    NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_reason(row: &Row<'_>, index: usize) -> rusqlite::Result<ExitReason> {
    let raw: String = row.get(index)?;
    raw.parse().map_err(|e: RebounderError| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn pool_error(e: r2d2::Error) -> RebounderError {
    RebounderError::Database {
        reason: e.to_string(),
    }
}

fn query_error(e: rusqlite::Error) -> RebounderError {
    RebounderError::DatabaseQuery {
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::DEFAULT_POLICY;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event(instrument: &str, day: u32, periods: usize) -> CrashEvent {
        CrashEvent {
            instrument: instrument.into(),
            date: date(2024, 3, day),
            close: 100.0,
            crash_pct: -12.5,
            volume: 2_000_000,
            forward: (0..periods)
                .map(|i| ForwardPeriod {
                    ret: 0.01 * (i as f64 + 1.0),
                    high: 102.0 + i as f64,
                    low: 98.0 - i as f64,
                })
                .collect(),
            rebound_probability: if day % 2 == 0 { Some(0.75) } else { None },
        }
    }

    fn timestamp(day: u32) -> NaiveDateTime {
        date(2024, 3, day).and_hms_opt(9, 30, 0).unwrap()
    }

    #[test]
    fn events_round_trip_with_forward_windows() {
        let db = SqliteAdapter::in_memory().unwrap();
        let events = vec![event("005930", 4, 5), event("005930", 5, 3), event("000660", 4, 0)];
        assert_eq!(db.insert_events(&events).unwrap(), 3);

        let loaded = db
            .crash_events("005930", date(2024, 3, 1), date(2024, 3, 31))
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], events[0]);
        assert_eq!(loaded[1], events[1]);

        let all = db
            .crash_events_between(date(2024, 3, 4), date(2024, 3, 4))
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].instrument, "000660");
        assert!(all[0].forward.is_empty());

        assert_eq!(db.list_instruments().unwrap(), vec!["000660", "005930"]);
    }

    #[test]
    fn reinserting_an_event_replaces_it() {
        let db = SqliteAdapter::in_memory().unwrap();
        db.insert_events(&[event("005930", 4, 5)]).unwrap();
        db.insert_events(&[event("005930", 4, 2)]).unwrap();
        assert_eq!(db.event_count().unwrap(), 1);
        let loaded = db
            .crash_events("005930", date(2024, 3, 4), date(2024, 3, 4))
            .unwrap();
        assert_eq!(loaded[0].forward.len(), 2);
    }

    #[test]
    fn positions_round_trip_including_pending_orders() {
        let db = SqliteAdapter::in_memory().unwrap();
        let mut entered = Position::pending_entry(1, "005930", 1e6, 0.7, DEFAULT_POLICY, timestamp(4));
        entered.apply_fill(500, 100.0);
        entered.committed = 50_000.0;
        entered.realized_pnl = 1_250.0;
        entered.transition(PositionState::Entered).unwrap();

        let mut pending = Position::pending_entry(2, "000660", 1e6, 0.8, DEFAULT_POLICY.without_averaging(), timestamp(5));
        pending.pending = Some(PendingOrder {
            purpose: OrderPurpose::Entry,
            quantity: 42,
            reference_price: 120.0,
            reserved: 5_040.0,
            requested_at: timestamp(5),
        });

        db.save_position(&entered).unwrap();
        db.save_position(&pending).unwrap();
        let loaded = db.load_positions().unwrap();
        assert_eq!(loaded, vec![entered.clone(), pending]);

        db.remove_position(2).unwrap();
        assert_eq!(db.load_positions().unwrap(), vec![entered]);
    }

    #[test]
    fn trade_append_is_idempotent() {
        let db = SqliteAdapter::in_memory().unwrap();
        let trade = ClosedTrade {
            id: 7,
            instrument: "005930".into(),
            quantity: 500,
            entry_price: 100.0,
            exit_price: 108.0,
            capital: 50_000.0,
            entry_time: timestamp(4),
            exit_time: timestamp(6),
            reason: ExitReason::TargetProfit,
            pnl: 4_000.0,
            exit_return: 0.08,
            averaged: false,
        };
        db.append_trade(&trade).unwrap();
        let mut again = trade.clone();
        again.pnl = -1.0;
        db.append_trade(&again).unwrap();
        assert_eq!(db.load_trades().unwrap(), vec![trade]);
    }

    #[test]
    fn global_policy_round_trip() {
        let db = SqliteAdapter::in_memory().unwrap();
        assert_eq!(db.load_global_policy().unwrap(), None);
        let policy = ExitPolicy::new(0.10, -0.03, None, 5).unwrap();
        db.save_global_policy(&DEFAULT_POLICY).unwrap();
        db.save_global_policy(&policy).unwrap();
        assert_eq!(db.load_global_policy().unwrap(), Some(policy));
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let path = path.to_str().unwrap();
        {
            let db = SqliteAdapter::open(path, 2).unwrap();
            db.save_global_policy(&DEFAULT_POLICY).unwrap();
            db.insert_events(&[event("005930", 4, 5)]).unwrap();
        }
        let db = SqliteAdapter::open(path, 2).unwrap();
        assert_eq!(db.load_global_policy().unwrap(), Some(DEFAULT_POLICY));
        assert_eq!(db.event_count().unwrap(), 1);
    }
}
