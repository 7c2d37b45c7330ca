//! Aggregate store
//!
//! Durable daily aggregates keyed by `(userid, hd-context-date)`:
//!
//! - partition key: the user id
//! - sort key: the metric code `type#qualifier#date`
//!
//! Because the date is the trailing, fixed-width part of the sort key, a
//! range over sort keys for one `type#qualifier` prefix is a range over dates.
//!
//! Every record carries a `version` that the store bumps on each write.
//! Writers pass the version they read back as a [`WriteCondition`] so that a
//! read-modify-write racing with another writer is reported as
//! [`WriteOutcome::Conflict`] instead of silently dropping an update.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::DailyAggregate;

/// Fields a merge writes. Anything else on the record is left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateUpdate {
    pub quantity: Decimal,
    pub unit: String,
    /// `None` keeps whatever count the record already has
    pub referred_count: Option<u64>,
}

/// Precondition for an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Unconditional upsert
    Any,
    /// Only create; fail if a record exists
    Absent,
    /// Only update a record still at this version
    Version(u64),
}

impl WriteCondition {
    /// Condition matching what a read returned
    pub fn observed(record: Option<&DailyAggregate>) -> Self {
        match record {
            Some(record) => WriteCondition::Version(record.version),
            None => WriteCondition::Absent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: u64 },
    Conflict,
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Strongly consistent point read
    async fn get(&self, user_id: &str, metric_code: &str) -> Result<Option<DailyAggregate>>;

    /// Create or update one record, subject to `condition`
    async fn upsert(
        &self,
        user_id: &str,
        metric_code: &str,
        update: &AggregateUpdate,
        condition: WriteCondition,
    ) -> Result<WriteOutcome>;

    /// Records whose sort key lies in `[from_key, to_key]`, ordered by sort key
    async fn query_range(
        &self,
        user_id: &str,
        from_key: &str,
        to_key: &str,
    ) -> Result<Vec<DailyAggregate>>;
}
