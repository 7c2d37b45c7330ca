//! Period roll-ups over daily aggregates
//!
//! | insight-type | bucket        | bar dates                          |
//! |--------------|---------------|------------------------------------|
//! | `W`, `M`     | one per day   | `date`                             |
//! | `6M`         | ISO week      | `startDate` Monday, `endDate` +6d  |
//! | `Y`          | calendar month| `startDate` 1st, `endDate` last day|

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Datelike, Days, Months, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{InsightsError, Result};
use crate::metrics::NOT_APPLICABLE;
use crate::models::{format_decimal, DailyAggregate, DATE_FORMAT, DELIMITER};
use crate::store::AggregateStore;

/// Short chart label, e.g. `04 Mar`
const LABEL_FORMAT: &str = "%d %b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "W")]
    Weekly,
    #[serde(rename = "M")]
    Monthly,
    #[serde(rename = "6M")]
    SixMonthly,
    #[serde(rename = "Y")]
    Yearly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Weekly => "W",
            Granularity::Monthly => "M",
            Granularity::SixMonthly => "6M",
            Granularity::Yearly => "Y",
        }
    }

    /// Bucket a daily aggregate's date falls into
    pub fn period_key(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Weekly | Granularity::Monthly => date,
            Granularity::SixMonthly => {
                let since_monday = u64::from(date.weekday().num_days_from_monday());
                date.checked_sub_days(Days::new(since_monday)).unwrap_or(date)
            }
            Granularity::Yearly => date.with_day(1).unwrap_or(date),
        }
    }

    /// Last day covered by the bucket starting at `key`, for ranged bars
    pub fn period_end(&self, key: NaiveDate) -> Option<NaiveDate> {
        match self {
            Granularity::Weekly | Granularity::Monthly => None,
            Granularity::SixMonthly => Some(key.checked_add_days(Days::new(6)).unwrap_or(key)),
            Granularity::Yearly => Some(
                key.checked_add_months(Months::new(1))
                    .and_then(|next| next.pred_opt())
                    .unwrap_or(key),
            ),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = InsightsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "W" => Ok(Granularity::Weekly),
            "M" => Ok(Granularity::Monthly),
            "6M" => Ok(Granularity::SixMonthly),
            "Y" => Ok(Granularity::Yearly),
            other => Err(InsightsError::invalid_request(format!(
                "unknown insight-type `{other}`, expected W, M, 6M or Y"
            ))),
        }
    }
}

/// Roll-up query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupRequest {
    #[serde(rename = "insight-type")]
    pub granularity: Granularity,
    #[serde(rename = "userid")]
    pub user_id: String,
    /// Metric code prefix `type#qualifier`
    #[serde(rename = "hd-context")]
    pub context: String,
    #[serde(rename = "fromDate")]
    pub from: NaiveDate,
    #[serde(rename = "toDate")]
    pub to: NaiveDate,
}

impl RollupRequest {
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(InsightsError::invalid_request("userid must not be empty"));
        }
        if self.context.is_empty() {
            return Err(InsightsError::invalid_request("hd-context must not be empty"));
        }
        Ok(())
    }

    fn sort_key(&self, date: NaiveDate) -> String {
        format!("{}{DELIMITER}{}", self.context, date.format(DATE_FORMAT))
    }
}

/// Dates a bar covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BarSpan {
    Range {
        #[serde(rename = "startDate")]
        start_date: NaiveDate,
        #[serde(rename = "endDate")]
        end_date: NaiveDate,
    },
    Day {
        date: NaiveDate,
    },
}

/// One chart bar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodBar {
    pub label: String,
    #[serde(flatten)]
    pub span: BarSpan,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupResponse {
    #[serde(rename = "insight-type")]
    pub granularity: Granularity,
    #[serde(rename = "userid")]
    pub user_id: String,
    #[serde(rename = "hd-context")]
    pub context: String,
    pub unit: String,
    pub average: String,
    pub min: String,
    pub max: String,
    pub change: String,
    #[serde(rename = "data")]
    pub bars: Vec<PeriodBar>,
}

/// Summary statistics over the bar values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarStats {
    pub average: Decimal,
    pub min: Decimal,
    pub max: Decimal,
    /// Last bar minus first bar
    pub change: Decimal,
}

fn mean(values: &[Decimal]) -> Result<Decimal> {
    if values.is_empty() {
        return Ok(Decimal::ZERO);
    }
    let overflow = || InsightsError::Overflow("period average".to_string());
    let sum = values
        .iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(*v))
        .ok_or_else(overflow)?;
    sum.checked_div(Decimal::from(values.len())).ok_or_else(overflow)
}

/// Group daily quantities by period key, ascending
pub fn bucket(
    records: &[DailyAggregate],
    granularity: Granularity,
) -> Result<BTreeMap<NaiveDate, Vec<Decimal>>> {
    let mut buckets: BTreeMap<NaiveDate, Vec<Decimal>> = BTreeMap::new();
    for record in records {
        let key = granularity.period_key(record.date()?);
        buckets.entry(key).or_default().push(record.quantity);
    }
    Ok(buckets)
}

pub fn summarize(values: &[Decimal]) -> Result<BarStats> {
    let (Some(first), Some(last)) = (values.first(), values.last()) else {
        return Ok(BarStats::default());
    };

    Ok(BarStats {
        average: mean(values)?,
        min: values.iter().copied().fold(*first, Decimal::min),
        max: values.iter().copied().fold(*first, Decimal::max),
        change: last
            .checked_sub(*first)
            .ok_or_else(|| InsightsError::Overflow("period change".to_string()))?,
    })
}

/// Build the roll-up for already queried records
pub fn rollup(request: &RollupRequest, records: &[DailyAggregate]) -> Result<RollupResponse> {
    let unit = records
        .first()
        .map(|r| r.unit.clone())
        .unwrap_or_else(|| NOT_APPLICABLE.to_string());

    let mut values = Vec::new();
    let mut bars = Vec::new();
    for (key, quantities) in bucket(records, request.granularity)? {
        let value = mean(&quantities)?;
        let span = match request.granularity.period_end(key) {
            Some(end_date) => BarSpan::Range {
                start_date: key,
                end_date,
            },
            None => BarSpan::Day { date: key },
        };
        bars.push(PeriodBar {
            label: key.format(LABEL_FORMAT).to_string(),
            span,
            value: format_decimal(value),
        });
        values.push(value);
    }

    let stats = summarize(&values)?;

    Ok(RollupResponse {
        granularity: request.granularity,
        user_id: request.user_id.clone(),
        context: request.context.clone(),
        unit,
        average: format_decimal(stats.average),
        min: format_decimal(stats.min),
        max: format_decimal(stats.max),
        change: format_decimal(stats.change),
        bars,
    })
}

/// Serves roll-up queries from an [`AggregateStore`]
pub struct RollupEngine {
    store: Arc<dyn AggregateStore>,
}

impl RollupEngine {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self { store }
    }

    pub async fn query(&self, request: &RollupRequest) -> Result<RollupResponse> {
        request.validate()?;

        let records = self
            .store
            .query_range(
                &request.user_id,
                &request.sort_key(request.from),
                &request.sort_key(request.to),
            )
            .await?;

        let response = rollup(request, &records)?;
        info!(
            user_id = %request.user_id,
            context = %request.context,
            insight_type = %request.granularity,
            records = records.len(),
            bars = response.bars.len(),
            "roll-up served"
        );
        Ok(response)
    }
}
