//! Batch-local grouping of raw samples into partial sums

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::events::{ChangeEvent, EventBatch, RawSample};
use crate::metrics::{Metric, MergeFamily};
use crate::models::MetricCode;

/// Grouping key. One key maps to exactly one metric code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartialKey {
    pub user_id: String,
    pub metric: &'static str,
    pub qualifier: String,
    pub date: NaiveDate,
}

/// Sum and count of the samples seen for one key within a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPartial {
    pub user_id: String,
    pub metric: Metric,
    pub qualifier: String,
    pub date: NaiveDate,
    pub sum: Decimal,
    pub count: u64,
    /// Unit of the last sample seen for this key
    pub unit: String,
}

impl BatchPartial {
    fn from_sample(sample: &RawSample) -> Self {
        Self {
            user_id: sample.user_id.clone(),
            metric: sample.metric,
            qualifier: sample.qualifier.clone(),
            date: sample.date,
            sum: Decimal::ZERO,
            count: 0,
            unit: sample.unit.clone(),
        }
    }

    pub fn metric_code(&self) -> MetricCode {
        MetricCode::new(self.metric, self.qualifier.clone(), self.date)
    }

    /// Whether this partial changes the stored aggregate at all
    pub fn has_contribution(&self) -> bool {
        match self.metric.family {
            MergeFamily::Average => self.count > 0,
            MergeFamily::Sum => !self.sum.is_zero(),
        }
    }
}

/// Per-batch event accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// Decoded and folded into a partial
    pub accepted: usize,
    /// Not a create or update
    pub ignored: usize,
    /// Malformed or invalid, dropped
    pub skipped: usize,
}

/// Output of grouping one batch
#[derive(Debug, Clone, Default)]
pub struct GroupedBatch {
    /// Ordered by user, metric, qualifier and date
    pub partials: Vec<BatchPartial>,
    pub stats: GroupStats,
}

/// Accumulates samples of one batch in memory
#[derive(Debug, Default)]
pub struct BatchGrouper {
    partials: BTreeMap<PartialKey, BatchPartial>,
    stats: GroupStats,
}

impl BatchGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an undecoded batch record
    pub fn add_record(&mut self, record: &serde_json::Value) {
        match ChangeEvent::deserialize(record) {
            Ok(event) => self.add_event(&event),
            Err(e) => {
                debug!(error = %e, "skipping undecodable change-event");
                self.stats.skipped += 1;
            }
        }
    }

    pub fn add_event(&mut self, event: &ChangeEvent) {
        if !event.is_upsert() {
            self.stats.ignored += 1;
            return;
        }

        let Some(image) = event.dynamodb.new_image.as_ref() else {
            debug!(kind = ?event.kind, "skipping change-event without a new image");
            self.stats.skipped += 1;
            return;
        };

        match RawSample::decode(image) {
            Ok(sample) => self.add_sample(&sample),
            Err(e) => {
                debug!(error = %e, "skipping invalid sample");
                self.stats.skipped += 1;
            }
        }
    }

    pub fn add_sample(&mut self, sample: &RawSample) {
        let key = PartialKey {
            user_id: sample.user_id.clone(),
            metric: sample.metric.name,
            qualifier: sample.qualifier.clone(),
            date: sample.date,
        };

        let partial = self
            .partials
            .entry(key)
            .or_insert_with(|| BatchPartial::from_sample(sample));
        let Some(sum) = partial.sum.checked_add(sample.quantity) else {
            debug!(metric_code = %partial.metric_code(), "skipping sample that overflows the batch sum");
            self.stats.skipped += 1;
            return;
        };
        partial.sum = sum;
        partial.count += 1;
        partial.unit.clone_from(&sample.unit);
        self.stats.accepted += 1;
    }

    pub fn finish(self) -> GroupedBatch {
        GroupedBatch {
            partials: self.partials.into_values().collect(),
            stats: self.stats,
        }
    }
}

/// Group every record of a batch
pub fn group_batch(batch: &EventBatch) -> GroupedBatch {
    let mut grouper = BatchGrouper::new();
    for record in &batch.records {
        grouper.add_record(record);
    }
    grouper.finish()
}
