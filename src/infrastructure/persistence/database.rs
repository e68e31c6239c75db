use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Owns the connection pool and schema migration for the SQLite-backed
/// persistence layer (spec.md §6 "Persisted layout").
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path) = db_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create database directory {}", parent.display()))?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid database url {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to sqlite database")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.context("failed to acquire connection for migration")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                coin TEXT NOT NULL,
                interval TEXT NOT NULL,
                source TEXT NOT NULL,
                t INTEGER NOT NULL,
                o REAL NOT NULL,
                h REAL NOT NULL,
                l REAL NOT NULL,
                c REAL NOT NULL,
                v REAL NOT NULL,
                n INTEGER NOT NULL,
                PRIMARY KEY (coin, interval, source, t)
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create candles table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_candles_lookup ON candles (coin, interval, source, t)",
        )
        .execute(&mut *conn)
        .await
        .context("failed to create candles index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_meta (
                coin TEXT NOT NULL,
                interval TEXT NOT NULL,
                source TEXT NOT NULL,
                last_ts INTEGER NOT NULL,
                PRIMARY KEY (coin, interval, source)
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create sync_meta table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                alert_id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                coin TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL,
                stop_loss REAL NOT NULL,
                take_profits TEXT NOT NULL,
                risk_check_passed INTEGER NOT NULL,
                risk_check_reason TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create signals table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id TEXT NOT NULL,
                hl_order_id TEXT,
                coin TEXT NOT NULL,
                side TEXT NOT NULL,
                size REAL NOT NULL,
                price REAL,
                order_type TEXT NOT NULL,
                tag TEXT NOT NULL,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                filled_at TEXT
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create orders table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_coin ON orders (coin)")
            .execute(&mut *conn)
            .await
            .context("failed to create orders coin index")?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_hl_order_id ON orders (hl_order_id) WHERE hl_order_id IS NOT NULL")
            .execute(&mut *conn)
            .await
            .context("failed to create orders hl_order_id index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fills (
                hl_order_id TEXT NOT NULL,
                fill_id TEXT NOT NULL,
                coin TEXT NOT NULL,
                price REAL NOT NULL,
                size REAL NOT NULL,
                fee REAL NOT NULL,
                filled_at TEXT NOT NULL,
                PRIMARY KEY (hl_order_id, fill_id)
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create fills table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                equity REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                open_position_count INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create equity_snapshots table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_equity_snapshots_ts ON equity_snapshots (ts)")
            .execute(&mut *conn)
            .await
            .context("failed to create equity_snapshots index")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_schema_on_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perpd.db");
        let url = format!("sqlite://{}", path.display());

        let db = Database::new(&url).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM candles")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn reopening_an_existing_database_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perpd.db");
        let url = format!("sqlite://{}", path.display());

        Database::new(&url).await.unwrap();
        let db = Database::new(&url).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
