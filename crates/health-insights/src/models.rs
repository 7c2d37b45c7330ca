//! Data models shared by the merge and rollup paths

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{InsightsError, Result};
use crate::metrics::Metric;

/// Separator between the parts of a metric code
pub const DELIMITER: char = '#';

/// Calendar format for dates inside metric codes and requests
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|_| InsightsError::InvalidDateFormat(s.to_string()))
}

/// Render a decimal the way aggregates are persisted: no trailing fractional zeros
pub fn format_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

/// Sort-key prefix shared by all dates of one metric and qualifier
pub fn code_prefix(metric: &str, qualifier: &str) -> String {
    format!("{metric}{DELIMITER}{qualifier}")
}

/// Composite key `type#qualifier#date` identifying one daily aggregate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricCode {
    pub metric: Metric,
    pub qualifier: String,
    pub date: NaiveDate,
}

impl MetricCode {
    pub fn new(metric: Metric, qualifier: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            metric,
            qualifier: qualifier.into(),
            date,
        }
    }
}

impl fmt::Display for MetricCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIMITER}{}",
            code_prefix(self.metric.name, &self.qualifier),
            self.date.format(DATE_FORMAT)
        )
    }
}

/// Durable per-day aggregate for one user and metric code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub user_id: String,
    /// Sort key, `type#qualifier#date`
    pub metric_code: String,
    /// Running average or running total, depending on the merge family
    pub quantity: Decimal,
    pub unit: String,
    /// Samples folded into `quantity`; only written for the averaging family
    pub referred_count: Option<u64>,
    /// Store-managed write counter used for conditional updates
    pub version: u64,
}

impl DailyAggregate {
    /// Referred count, treating records written without one as a single sample
    pub fn effective_referred_count(&self) -> u64 {
        self.referred_count.unwrap_or(1)
    }

    /// Date component of the sort key
    pub fn date(&self) -> Result<NaiveDate> {
        let date = self
            .metric_code
            .rsplit(DELIMITER)
            .next()
            .unwrap_or_default();
        parse_date(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::classify;
    use std::str::FromStr;

    #[test]
    fn test_metric_code_display() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let code = MetricCode::new(classify("sleep_count").unwrap(), "deep", date);
        assert_eq!(code.to_string(), "sleep_count#deep#2024-03-05");
    }

    #[test]
    fn test_codes_sort_by_date() {
        let hr = classify("heart_rate").unwrap();
        let a = MetricCode::new(hr, "NA", NaiveDate::from_ymd_opt(2024, 9, 30).unwrap());
        let b = MetricCode::new(hr, "NA", NaiveDate::from_ymd_opt(2024, 10, 1).unwrap());
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2024-02-29").unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert!(matches!(
            parse_date("2024/02/29"),
            Err(InsightsError::InvalidDateFormat(_))
        ));
    }

    #[test]
    fn test_format_decimal_strips_trailing_zeros() {
        let value = Decimal::from_str("70.000").unwrap();
        assert_eq!(format_decimal(value), "70");
        let value = Decimal::from_str("1700").unwrap();
        assert_eq!(format_decimal(value), "1700");
        let value = Decimal::from_str("36.50").unwrap();
        assert_eq!(format_decimal(value), "36.5");
    }

    #[test]
    fn test_aggregate_date_and_default_count() {
        let record = DailyAggregate {
            user_id: "u1".to_string(),
            metric_code: "heart_rate#NA#2024-12-15".to_string(),
            quantity: Decimal::from(72),
            unit: "bpm".to_string(),
            referred_count: None,
            version: 1,
        };
        assert_eq!(record.date().unwrap(), NaiveDate::from_ymd_opt(2024, 12, 15).unwrap());
        assert_eq!(record.effective_referred_count(), 1);
    }
}
