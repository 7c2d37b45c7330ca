//! Aggregate merge engine
//!
//! Folds the partial sums of one change-event batch into the persisted daily
//! aggregates:
//!
//! - averaging family: `(batch_sum + avg * referred) / (batch_count + referred)`
//! - summing family: `batch_sum + total`
//!
//! Each metric code is an independent read-merge-write. Codes are merged
//! concurrently; a code never appears twice in one grouped batch, so writes to
//! the same key within a batch cannot interleave. Across batches the write is
//! conditional on the version read, and a conflict re-reads and recomputes.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::MergeConfig;
use crate::error::{InsightsError, Result};
use crate::events::EventBatch;
use crate::grouper::{group_batch, BatchPartial, GroupStats, GroupedBatch};
use crate::metrics::MergeFamily;
use crate::models::DailyAggregate;
use crate::store::{AggregateStore, AggregateUpdate, WriteCondition, WriteOutcome};

/// Compute the new aggregate fields for one partial.
///
/// An absent record counts as quantity 0 with no referred samples. A record
/// of the averaging family written without a referred count counts as one
/// sample.
pub fn combine(partial: &BatchPartial, existing: Option<&DailyAggregate>) -> Result<AggregateUpdate> {
    let overflow = || InsightsError::Overflow(partial.metric_code().to_string());

    match partial.metric.family {
        MergeFamily::Average => {
            let (average, referred) = existing
                .map(|r| (r.quantity, r.effective_referred_count()))
                .unwrap_or((Decimal::ZERO, 0));

            let total = average
                .checked_mul(Decimal::from(referred))
                .and_then(|prior| prior.checked_add(partial.sum))
                .ok_or_else(overflow)?;
            let count = referred.checked_add(partial.count).ok_or_else(overflow)?;
            let quantity = if count == 0 {
                Decimal::ZERO
            } else {
                total.checked_div(Decimal::from(count)).ok_or_else(overflow)?
            };

            Ok(AggregateUpdate {
                quantity,
                unit: partial.unit.clone(),
                referred_count: Some(count),
            })
        }
        MergeFamily::Sum => {
            let prior = existing.map(|r| r.quantity).unwrap_or(Decimal::ZERO);
            Ok(AggregateUpdate {
                quantity: prior.checked_add(partial.sum).ok_or_else(overflow)?,
                unit: partial.unit.clone(),
                referred_count: None,
            })
        }
    }
}

/// Result of merging one metric code
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub user_id: String,
    pub metric_code: String,
    pub created: bool,
    pub quantity: Decimal,
    pub referred_count: Option<u64>,
    pub version: u64,
    /// Read-merge-write rounds, more than one after a conflict
    pub attempts: u32,
}

/// A metric code whose merge was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeFailure {
    pub user_id: String,
    pub metric_code: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub stats: GroupStats,
    pub merged: Vec<MergeOutcome>,
    pub failed: Vec<MergeFailure>,
}

impl MergeReport {
    /// Every metric code of the batch was written
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn created(&self) -> usize {
        self.merged.iter().filter(|m| m.created).count()
    }

    pub fn updated(&self) -> usize {
        self.merged.len() - self.created()
    }

    /// Extra read-merge-write rounds caused by conflicting writers
    pub fn conflicts(&self) -> u32 {
        self.merged.iter().map(|m| m.attempts - 1).sum()
    }
}

/// Merges change-event batches into an [`AggregateStore`]
pub struct MergeEngine {
    store: Arc<dyn AggregateStore>,
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self::with_config(store, MergeConfig::default())
    }

    pub fn with_config(store: Arc<dyn AggregateStore>, config: MergeConfig) -> Self {
        Self { store, config }
    }

    /// Group and merge one batch.
    ///
    /// Malformed events and per-key store failures are recorded in the
    /// report; only an unexpected failure of the merge itself is an error.
    pub async fn merge_batch(&self, batch: &EventBatch) -> Result<MergeReport> {
        let grouped = group_batch(batch);
        self.merge_grouped(grouped).await
    }

    pub async fn merge_grouped(&self, grouped: GroupedBatch) -> Result<MergeReport> {
        let mut report = MergeReport {
            stats: grouped.stats,
            ..MergeReport::default()
        };

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_merges.max(1)));
        let mut tasks = JoinSet::new();

        for partial in grouped.partials {
            if !partial.has_contribution() {
                debug!(metric_code = %partial.metric_code(), "no contribution, skipping");
                continue;
            }

            let store = Arc::clone(&self.store);
            let config = self.config.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = merge_partial(store.as_ref(), &partial, &config).await;
                (partial, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (partial, result) =
                joined.map_err(|e| InsightsError::Internal(format!("merge task failed: {}", e)))?;

            match result {
                Ok(outcome) => report.merged.push(outcome),
                Err(e) => {
                    let metric_code = partial.metric_code().to_string();
                    warn!(
                        user_id = %partial.user_id,
                        metric_code = %metric_code,
                        error = %e,
                        "failed to merge aggregate"
                    );
                    report.failed.push(MergeFailure {
                        user_id: partial.user_id,
                        metric_code,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
            .merged
            .sort_by(|a, b| (&a.user_id, &a.metric_code).cmp(&(&b.user_id, &b.metric_code)));
        report
            .failed
            .sort_by(|a, b| (&a.user_id, &a.metric_code).cmp(&(&b.user_id, &b.metric_code)));

        info!(
            accepted = report.stats.accepted,
            ignored = report.stats.ignored,
            skipped = report.stats.skipped,
            created = report.created(),
            updated = report.updated(),
            failed = report.failed.len(),
            conflicts = report.conflicts(),
            "batch aggregated"
        );

        Ok(report)
    }

    /// Merge a single partial into its stored aggregate
    pub async fn merge_one(&self, partial: &BatchPartial) -> Result<MergeOutcome> {
        merge_partial(self.store.as_ref(), partial, &self.config).await
    }
}

async fn merge_partial(
    store: &dyn AggregateStore,
    partial: &BatchPartial,
    config: &MergeConfig,
) -> Result<MergeOutcome> {
    let metric_code = partial.metric_code().to_string();
    let max_attempts = config.max_conflict_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;

        let existing = store.get(&partial.user_id, &metric_code).await?;
        let update = combine(partial, existing.as_ref())?;
        let condition = if config.optimistic_concurrency {
            WriteCondition::observed(existing.as_ref())
        } else {
            WriteCondition::Any
        };

        match store
            .upsert(&partial.user_id, &metric_code, &update, condition)
            .await?
        {
            WriteOutcome::Written { version } => {
                let referred_count = update
                    .referred_count
                    .or_else(|| existing.as_ref().and_then(|r| r.referred_count));
                return Ok(MergeOutcome {
                    user_id: partial.user_id.clone(),
                    metric_code,
                    created: existing.is_none(),
                    quantity: update.quantity,
                    referred_count,
                    version,
                    attempts,
                });
            }
            WriteOutcome::Conflict if attempts < max_attempts => {
                debug!(metric_code = %metric_code, attempts, "write conflict, re-reading aggregate");
            }
            WriteOutcome::Conflict => {
                return Err(InsightsError::Conflict {
                    metric_code,
                    attempts,
                });
            }
        }
    }
}
