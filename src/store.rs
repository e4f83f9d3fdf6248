use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::math::Cents;

/// Audit-trail writer. Holds only the database path: `Connection` cannot be
/// shared across tasks, and at a few rows per tick it is cheaper to open a
/// short-lived WAL connection per write than to funnel writes through a
/// dedicated thread.
#[derive(Clone)]
pub struct SqliteStore {
    path: String,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        let path = path.trim();
        if path.is_empty() {
            anyhow::bail!("SQLITE_PATH is empty");
        }
        let on_disk = path != ":memory:" && !path.starts_with("file:");
        if on_disk {
            let dir = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty());
            if let Some(dir) = dir {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create {} for sqlite", dir.display()))?;
            }
        }
        Ok(Self {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("sqlite open {}", self.path))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(conn)
    }

    pub fn init_db(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS orders (
  order_id TEXT PRIMARY KEY,
  ticker TEXT,
  side TEXT,
  price_cents INTEGER,
  size INTEGER,
  created_ts REAL,
  status TEXT,
  remaining INTEGER
);

CREATE INDEX IF NOT EXISTS idx_orders_ticker ON orders(ticker, created_ts);

CREATE TABLE IF NOT EXISTS fills (
  order_id TEXT,
  fill_index INTEGER,
  ticker TEXT,
  side TEXT,
  price_cents INTEGER,
  size INTEGER,
  ts REAL,
  PRIMARY KEY (order_id, fill_index)
);

CREATE INDEX IF NOT EXISTS idx_fills_ticker ON fills(ticker, ts);

CREATE TABLE IF NOT EXISTS position_snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts REAL,
  ticker TEXT,
  qty INTEGER,
  avg_price REAL,
  realized_pnl REAL
);

CREATE INDEX IF NOT EXISTS idx_positions_ts ON position_snapshots(ts);

CREATE TABLE IF NOT EXISTS runtime_status (
  component TEXT PRIMARY KEY,
  ts REAL,
  level TEXT,
  message TEXT,
  detail TEXT
);
"#,
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_order(
        &self,
        order_id: &str,
        ticker: &str,
        side: &str,
        price: Cents,
        size: i64,
        created_ts: f64,
        status: &str,
    ) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO orders(order_id, ticker, side, price_cents, size, created_ts, status, remaining)
VALUES(?,?,?,?,?,?,?,?)
ON CONFLICT(order_id) DO UPDATE SET status=excluded.status, remaining=excluded.remaining
"#,
            params![order_id, ticker, side, price, size, created_ts, status, size],
        )?;
        Ok(())
    }

    pub fn update_order_status(
        &self,
        order_id: &str,
        status: &str,
        remaining: Option<i64>,
    ) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            "UPDATE orders SET status=?, remaining=COALESCE(?, remaining) WHERE order_id=?",
            params![status, remaining, order_id],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_fill(
        &self,
        ticker: &str,
        order_id: &str,
        side: &str,
        price: Cents,
        size: i64,
        ts: f64,
        fill_index: u64,
    ) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT OR IGNORE INTO fills(order_id, fill_index, ticker, side, price_cents, size, ts)
VALUES(?,?,?,?,?,?,?)
"#,
            params![order_id, fill_index as i64, ticker, side, price, size, ts],
        )?;
        Ok(())
    }

    pub fn insert_position_snapshot(
        &self,
        ts: f64,
        ticker: &str,
        qty: i64,
        avg_price: f64,
        realized_pnl: f64,
    ) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            "INSERT INTO position_snapshots(ts, ticker, qty, avg_price, realized_pnl) VALUES(?,?,?,?,?)",
            params![ts, ticker, qty, avg_price, realized_pnl],
        )?;
        Ok(())
    }

    pub fn upsert_runtime_status(
        &self,
        component: &str,
        level: &str,
        message: &str,
        detail: Option<&str>,
        ts: f64,
    ) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO runtime_status(component, ts, level, message, detail)
VALUES(?,?,?,?,?)
ON CONFLICT(component) DO UPDATE SET
  ts=excluded.ts,
  level=excluded.level,
  message=excluded.message,
  detail=excluded.detail
"#,
            params![component, ts, level, message, detail],
        )?;
        Ok(())
    }
}
