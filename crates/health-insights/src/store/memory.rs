//! In-process aggregate store

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{AggregateStore, AggregateUpdate, WriteCondition, WriteOutcome};
use crate::error::{InsightsError, Result};
use crate::models::DailyAggregate;

type Key = (String, String);

/// Aggregate store held in memory, ordered like the durable store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<Key, DailyAggregate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as-is, e.g. one written before referred counts existed
    pub fn insert_raw(&self, record: DailyAggregate) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(
            (record.user_id.clone(), record.metric_code.clone()),
            record,
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> InsightsError {
    InsightsError::store("memory store lock poisoned")
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn get(&self, user_id: &str, metric_code: &str) -> Result<Option<DailyAggregate>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .get(&(user_id.to_string(), metric_code.to_string()))
            .cloned())
    }

    async fn upsert(
        &self,
        user_id: &str,
        metric_code: &str,
        update: &AggregateUpdate,
        condition: WriteCondition,
    ) -> Result<WriteOutcome> {
        let mut records = self.records.write().map_err(poisoned)?;
        let key = (user_id.to_string(), metric_code.to_string());

        if let Some(existing) = records.get_mut(&key) {
            return Ok(match condition {
                WriteCondition::Any => apply(existing, update),
                WriteCondition::Version(v) if existing.version == v => apply(existing, update),
                _ => WriteOutcome::Conflict,
            });
        }

        if let WriteCondition::Version(_) = condition {
            return Ok(WriteOutcome::Conflict);
        }

        records.insert(
            key,
            DailyAggregate {
                user_id: user_id.to_string(),
                metric_code: metric_code.to_string(),
                quantity: update.quantity,
                unit: update.unit.clone(),
                referred_count: update.referred_count,
                version: 1,
            },
        );
        Ok(WriteOutcome::Written { version: 1 })
    }

    async fn query_range(
        &self,
        user_id: &str,
        from_key: &str,
        to_key: &str,
    ) -> Result<Vec<DailyAggregate>> {
        if from_key > to_key {
            return Ok(Vec::new());
        }
        let records = self.records.read().map_err(poisoned)?;
        let from = (user_id.to_string(), from_key.to_string());
        let to = (user_id.to_string(), to_key.to_string());
        Ok(records.range(from..=to).map(|(_, r)| r.clone()).collect())
    }
}

fn apply(existing: &mut DailyAggregate, update: &AggregateUpdate) -> WriteOutcome {
    existing.quantity = update.quantity;
    existing.unit.clone_from(&update.unit);
    if let Some(count) = update.referred_count {
        existing.referred_count = Some(count);
    }
    existing.version += 1;
    WriteOutcome::Written {
        version: existing.version,
    }
}
