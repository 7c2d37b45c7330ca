//! Metric classification table
//!
//! Every metric the aggregator understands is one row in [`METRICS`]. A row
//! names the wire identifier, the merge family and the qualifiers a sample of
//! that metric may carry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Qualifier for metrics without a sub-classification
pub const NOT_APPLICABLE: &str = "NA";

const SLEEP_STAGES: &[&str] = &[
    "in_the_bed",
    "light",
    "rem",
    "awake",
    "deep",
    "unspecified",
    NOT_APPLICABLE,
];

const NO_QUALIFIER: &[&str] = &[NOT_APPLICABLE];

/// How new samples combine with a persisted daily aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeFamily {
    /// Running average weighted by the referred count
    Average,
    /// Running grand total
    Sum,
}

/// One row of the classification table
#[derive(Debug, PartialEq, Eq)]
pub struct MetricSpec {
    /// Identifier used in metric codes and change-events
    pub name: &'static str,
    pub family: MergeFamily,
    pub qualifiers: &'static [&'static str],
}

impl MetricSpec {
    /// Whether `qualifier` is valid for this metric
    pub fn allows(&self, qualifier: &str) -> bool {
        self.qualifiers.contains(&qualifier)
    }
}

impl fmt::Display for MetricSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Classified metric, a reference into [`METRICS`]
pub type Metric = &'static MetricSpec;

pub static METRICS: &[MetricSpec] = &[
    MetricSpec {
        name: "heart_rate",
        family: MergeFamily::Average,
        qualifiers: NO_QUALIFIER,
    },
    MetricSpec {
        name: "step_count",
        family: MergeFamily::Sum,
        qualifiers: NO_QUALIFIER,
    },
    MetricSpec {
        name: "sleep_count",
        family: MergeFamily::Sum,
        qualifiers: SLEEP_STAGES,
    },
    MetricSpec {
        name: "spo2",
        family: MergeFamily::Average,
        qualifiers: NO_QUALIFIER,
    },
    MetricSpec {
        name: "skin_temperature",
        family: MergeFamily::Average,
        qualifiers: NO_QUALIFIER,
    },
];

/// Look up a metric by its wire identifier.
///
/// `None` means the metric is unknown and the sample should be dropped.
pub fn classify(name: &str) -> Option<Metric> {
    METRICS.iter().find(|spec| spec.name == name)
}
