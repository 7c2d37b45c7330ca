//! SQLite-backed aggregate store

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use super::{AggregateStore, AggregateUpdate, WriteCondition, WriteOutcome};
use crate::error::{InsightsError, Result};
use crate::models::{format_decimal, DailyAggregate};

const SELECT_COLUMNS: &str =
    "SELECT userid, hd_context_date, quantity, unit, hd_referred_count, version FROM daily_aggregates";

/// Durable aggregate store in a single SQLite file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the aggregate database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| InsightsError::store(format!("Failed to open aggregate database: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            InsightsError::store(format!("Failed to open in-memory database: {}", e))
        })?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| InsightsError::store("aggregate database lock poisoned"))
    }

    /// Run migrations
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS daily_aggregates (
                    userid TEXT NOT NULL,
                    hd_context_date TEXT NOT NULL,
                    quantity TEXT NOT NULL,
                    unit TEXT NOT NULL,
                    hd_referred_count TEXT,
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (userid, hd_context_date)
                );
                "#,
            )
            .map_err(|e| InsightsError::store(format!("Failed to run migrations: {}", e)))?;

        Ok(())
    }
}

fn text_column<T, E>(idx: usize, raw: &str, parse: impl Fn(&str) -> std::result::Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    parse(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_aggregate(row: &Row<'_>) -> rusqlite::Result<DailyAggregate> {
    let quantity: String = row.get(2)?;
    let referred_count: Option<String> = row.get(4)?;

    Ok(DailyAggregate {
        user_id: row.get(0)?,
        metric_code: row.get(1)?,
        quantity: text_column(2, &quantity, Decimal::from_str)?,
        unit: row.get(3)?,
        referred_count: referred_count
            .map(|raw| text_column(4, &raw, u64::from_str))
            .transpose()?,
        version: row.get(5)?,
    })
}

#[async_trait]
impl AggregateStore for SqliteStore {
    async fn get(&self, user_id: &str, metric_code: &str) -> Result<Option<DailyAggregate>> {
        self.conn()?
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE userid = ? AND hd_context_date = ?"),
                params![user_id, metric_code],
                row_to_aggregate,
            )
            .optional()
            .map_err(|e| InsightsError::store(format!("Failed to get aggregate: {}", e)))
    }

    async fn upsert(
        &self,
        user_id: &str,
        metric_code: &str,
        update: &AggregateUpdate,
        condition: WriteCondition,
    ) -> Result<WriteOutcome> {
        let quantity = format_decimal(update.quantity);
        let referred_count = update.referred_count.map(|c| c.to_string());
        let conn = self.conn()?;

        let version: Option<u64> = match condition {
            WriteCondition::Any => conn
                .query_row(
                    "INSERT INTO daily_aggregates (userid, hd_context_date, quantity, unit, hd_referred_count)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT (userid, hd_context_date) DO UPDATE SET
                         quantity = excluded.quantity,
                         unit = excluded.unit,
                         hd_referred_count = COALESCE(excluded.hd_referred_count, hd_referred_count),
                         version = version + 1
                     RETURNING version",
                    params![user_id, metric_code, quantity, update.unit, referred_count],
                    |row| row.get(0),
                )
                .optional(),
            WriteCondition::Absent => conn
                .query_row(
                    "INSERT INTO daily_aggregates (userid, hd_context_date, quantity, unit, hd_referred_count)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT (userid, hd_context_date) DO NOTHING
                     RETURNING version",
                    params![user_id, metric_code, quantity, update.unit, referred_count],
                    |row| row.get(0),
                )
                .optional(),
            WriteCondition::Version(expected) => conn
                .query_row(
                    "UPDATE daily_aggregates SET
                         quantity = ?,
                         unit = ?,
                         hd_referred_count = COALESCE(?, hd_referred_count),
                         version = version + 1
                     WHERE userid = ? AND hd_context_date = ? AND version = ?
                     RETURNING version",
                    params![quantity, update.unit, referred_count, user_id, metric_code, expected],
                    |row| row.get(0),
                )
                .optional(),
        }
        .map_err(|e| InsightsError::store(format!("Failed to save aggregate: {}", e)))?;

        Ok(match version {
            Some(version) => WriteOutcome::Written { version },
            None => WriteOutcome::Conflict,
        })
    }

    async fn query_range(
        &self,
        user_id: &str,
        from_key: &str,
        to_key: &str,
    ) -> Result<Vec<DailyAggregate>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_COLUMNS}
                 WHERE userid = ? AND hd_context_date BETWEEN ? AND ?
                 ORDER BY hd_context_date"
            ))
            .map_err(|e| InsightsError::store(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![user_id, from_key, to_key], row_to_aggregate)
            .map_err(|e| InsightsError::store(format!("Failed to query aggregates: {}", e)))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| InsightsError::store(format!("Failed to read aggregate: {}", e)))
    }
}
