//! Queryable order/fill store capability.
//!
//! The exporter and reconciliation only need a narrow read surface, kept
//! behind a trait so tests can substitute an in-memory double.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub ts: u64,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub status: String,
    pub strategy: String,
}

#[derive(Debug, Clone)]
pub struct FillRow {
    pub ts: u64,
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
}

pub trait OrderStore {
    fn orders_between(&self, t0: u64, t1: u64) -> Result<Vec<OrderRow>>;
    fn fills_between(&self, t0: u64, t1: u64) -> Result<Vec<FillRow>>;
    /// Net position per symbol from filled orders, BUY positive, SELL negative.
    fn net_positions(&self) -> Result<BTreeMap<String, f64>>;
}

pub struct SqliteOrderStore {
    conn: Connection,
}

impl SqliteOrderStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    /// Create the schema if absent. Idempotent.
    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                ts INTEGER NOT NULL,
                order_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL NOT NULL,
                status TEXT NOT NULL,
                strategy TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS fills (
                ts INTEGER NOT NULL,
                fill_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL NOT NULL,
                commission REAL NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_orders_ts ON orders(ts);
            CREATE INDEX IF NOT EXISTS idx_fills_ts ON fills(ts);",
        )?;
        Ok(())
    }

    pub fn insert_order(&self, row: &OrderRow) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO orders (ts, order_id, symbol, side, quantity, price, status, strategy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.ts,
                row.order_id,
                row.symbol,
                row.side,
                row.quantity,
                row.price,
                row.status,
                row.strategy
            ],
        )?;
        Ok(())
    }

    pub fn insert_fill(&self, row: &FillRow) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO fills (ts, fill_id, order_id, symbol, side, quantity, price, commission)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.ts,
                row.fill_id,
                row.order_id,
                row.symbol,
                row.side,
                row.quantity,
                row.price,
                row.commission
            ],
        )?;
        Ok(())
    }
}

impl OrderStore for SqliteOrderStore {
    fn orders_between(&self, t0: u64, t1: u64) -> Result<Vec<OrderRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, order_id, symbol, side, quantity, price, status, strategy
             FROM orders WHERE ts >= ?1 AND ts < ?2 ORDER BY ts",
        )?;
        let rows = stmt
            .query_map(params![t0, t1], |r| {
                Ok(OrderRow {
                    ts: r.get(0)?,
                    order_id: r.get(1)?,
                    symbol: r.get(2)?,
                    side: r.get(3)?,
                    quantity: r.get(4)?,
                    price: r.get(5)?,
                    status: r.get(6)?,
                    strategy: r.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn fills_between(&self, t0: u64, t1: u64) -> Result<Vec<FillRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, fill_id, order_id, symbol, side, quantity, price, commission
             FROM fills WHERE ts >= ?1 AND ts < ?2 ORDER BY ts",
        )?;
        let rows = stmt
            .query_map(params![t0, t1], |r| {
                Ok(FillRow {
                    ts: r.get(0)?,
                    fill_id: r.get(1)?,
                    order_id: r.get(2)?,
                    symbol: r.get(3)?,
                    side: r.get(4)?,
                    quantity: r.get(5)?,
                    price: r.get(6)?,
                    commission: r.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn net_positions(&self) -> Result<BTreeMap<String, f64>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol,
                    SUM(CASE WHEN UPPER(side) = 'BUY' THEN quantity ELSE -quantity END)
             FROM orders WHERE status = 'filled' GROUP BY symbol",
        )?;
        let mut positions = BTreeMap::new();
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?;
        for row in rows {
            let (symbol, qty) = row?;
            positions.insert(symbol, qty);
        }
        Ok(positions)
    }
}
