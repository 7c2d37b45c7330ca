//! Daily health aggregates and period roll-ups
//!
//! Change-events carrying raw samples are merged into one persisted
//! aggregate per user, metric and day. Roll-ups read those aggregates back
//! as weekly, monthly, six-monthly or yearly chart bars.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod grouper;
pub mod handler;
pub mod merge;
pub mod metrics;
pub mod models;
pub mod rollup;
pub mod store;

pub use config::Config;
pub use error::{InsightsError, Result, SampleError};
pub use events::{ChangeEvent, EventBatch, EventKind};
pub use handler::{Handler, StatusEnvelope};
pub use merge::{MergeEngine, MergeReport};
pub use metrics::{classify, MergeFamily, Metric};
pub use models::{DailyAggregate, MetricCode};
pub use rollup::{Granularity, RollupEngine, RollupRequest, RollupResponse};
pub use store::{AggregateStore, MemoryStore, SqliteStore};
