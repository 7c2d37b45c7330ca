//! Change-event batches delivered by the raw health-data store
//!
//! A batch arrives as `{"Records": [...]}` where every record carries an
//! `eventName` and, for inserts and updates, the new image of the raw row:
//!
//! ```json
//! {
//!   "eventName": "INSERT",
//!   "dynamodb": {
//!     "NewImage": {
//!       "userid": {"S": "u-42"},
//!       "hd-context-time": {"S": "heart_rate#NA#2024-12-15 07:31:00"},
//!       "quantity": {"S": "61"},
//!       "unit": {"S": "bpm"}
//!     }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SampleError};
use crate::metrics::{classify, Metric};
use crate::models::{DATE_FORMAT, DELIMITER};

pub const USER_ID: &str = "userid";
pub const HEALTH_CONTEXT_TIME: &str = "hd-context-time";
pub const QUANTITY: &str = "quantity";
pub const UNIT: &str = "unit";

/// Typed attribute value as found in a record image.
///
/// Rows may carry columns of any type (`BOOL`, `NULL`, `M`, `L`, ...); only
/// string and number values are ever read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
    #[serde(untagged)]
    Other(serde_json::Value),
}

impl AttributeValue {
    /// Text of a string or number value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) | AttributeValue::N(s) => Some(s),
            AttributeValue::Other(_) => None,
        }
    }
}

/// Attribute map of one raw row
pub type Item = HashMap<String, AttributeValue>;

/// Operation that produced a change-event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Modify,
    Remove,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "NewImage", default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<Item>,
}

/// One change-event from the raw store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventName")]
    pub kind: EventKind,
    #[serde(default)]
    pub dynamodb: StreamRecord,
}

impl ChangeEvent {
    pub fn new(kind: EventKind, new_image: Option<Item>) -> Self {
        Self {
            kind,
            dynamodb: StreamRecord { new_image },
        }
    }

    /// Build an event for one raw sample row
    pub fn sample(
        kind: EventKind,
        user_id: &str,
        health_context_time: &str,
        quantity: &str,
        unit: &str,
    ) -> Self {
        let image = Item::from([
            (USER_ID.to_string(), AttributeValue::S(user_id.to_string())),
            (
                HEALTH_CONTEXT_TIME.to_string(),
                AttributeValue::S(health_context_time.to_string()),
            ),
            (QUANTITY.to_string(), AttributeValue::S(quantity.to_string())),
            (UNIT.to_string(), AttributeValue::S(unit.to_string())),
        ]);
        Self::new(kind, Some(image))
    }

    /// Creates and updates feed the aggregates; everything else is ignored
    pub fn is_upsert(&self) -> bool {
        matches!(self.kind, EventKind::Insert | EventKind::Modify)
    }
}

/// Batch envelope. Records are kept as raw JSON so that one undecodable
/// record cannot fail the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(rename = "Records")]
    pub records: Vec<serde_json::Value>,
}

impl EventBatch {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_events(events: &[ChangeEvent]) -> Result<Self> {
        let records = events
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A decoded and validated sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub user_id: String,
    pub metric: Metric,
    pub qualifier: String,
    pub date: NaiveDate,
    pub quantity: Decimal,
    pub unit: String,
}

impl RawSample {
    /// Decode a raw row image into a sample
    pub fn decode(image: &Item) -> std::result::Result<Self, SampleError> {
        let user_id = attribute(image, USER_ID)?;
        let context = attribute(image, HEALTH_CONTEXT_TIME)?;
        let quantity = attribute(image, QUANTITY)?;
        let unit = attribute(image, UNIT)?;

        let parts: Vec<&str> = context.split(DELIMITER).collect();
        let [metric_name, qualifier, timestamp] = parts[..] else {
            return Err(SampleError::MalformedContext(context.to_string()));
        };

        let metric =
            classify(metric_name).ok_or_else(|| SampleError::UnknownMetric(metric_name.to_string()))?;
        if !metric.allows(qualifier) {
            return Err(SampleError::QualifierNotAllowed {
                metric: metric_name.to_string(),
                qualifier: qualifier.to_string(),
            });
        }

        let date = parse_sample_date(timestamp)?;
        let quantity = parse_quantity(quantity)?;

        Ok(Self {
            user_id: user_id.to_string(),
            metric,
            qualifier: qualifier.to_string(),
            date,
            quantity,
            unit: unit.to_string(),
        })
    }
}

fn attribute<'a>(image: &'a Item, name: &'static str) -> std::result::Result<&'a str, SampleError> {
    image
        .get(name)
        .ok_or(SampleError::MissingField(name))?
        .as_str()
        .ok_or(SampleError::UnsupportedAttribute(name))
}

/// Date portion of a sample timestamp such as `2024-12-15 07:31:00`
fn parse_sample_date(timestamp: &str) -> std::result::Result<NaiveDate, SampleError> {
    let date = timestamp
        .trim()
        .split(|c: char| c == ' ' || c == 'T')
        .next()
        .unwrap_or_default();
    NaiveDate::parse_from_str(date, DATE_FORMAT)
        .map_err(|_| SampleError::InvalidDate(timestamp.to_string()))
}

fn parse_quantity(raw: &str) -> std::result::Result<Decimal, SampleError> {
    let trimmed = raw.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| SampleError::InvalidQuantity(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(context: &str, quantity: &str) -> std::result::Result<RawSample, SampleError> {
        let event = ChangeEvent::sample(EventKind::Insert, "u1", context, quantity, "bpm");
        RawSample::decode(event.dynamodb.new_image.as_ref().unwrap())
    }

    #[test]
    fn test_decode_sample() {
        let sample = decode("heart_rate#NA#2024-12-15 07:31:00", "61.5").unwrap();
        assert_eq!(sample.user_id, "u1");
        assert_eq!(sample.metric.name, "heart_rate");
        assert_eq!(sample.qualifier, "NA");
        assert_eq!(sample.date, NaiveDate::from_ymd_opt(2024, 12, 15).unwrap());
        assert_eq!(sample.quantity, Decimal::from_str("61.5").unwrap());
        assert_eq!(sample.unit, "bpm");
    }

    #[test]
    fn test_decode_iso_timestamp_and_bare_date() {
        let iso = decode("step_count#NA#2024-01-02T23:59:59", "10").unwrap();
        assert_eq!(iso.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());

        let bare = decode("step_count#NA#2024-01-02", "10").unwrap();
        assert_eq!(bare.date, iso.date);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(
            decode("heart_rate#NA", "60"),
            Err(SampleError::MalformedContext(_))
        ));
        assert!(matches!(
            decode("heart_rate#NA#2024-12-15#extra", "60"),
            Err(SampleError::MalformedContext(_))
        ));
        assert!(matches!(
            decode("heart_rate#NA#15/12/2024", "60"),
            Err(SampleError::InvalidDate(_))
        ));
        assert!(matches!(
            decode("heart_rate#NA#2024-12-15", "sixty"),
            Err(SampleError::InvalidQuantity(_))
        ));
        assert!(matches!(
            decode("weight#NA#2024-12-15", "80"),
            Err(SampleError::UnknownMetric(_))
        ));
        assert!(matches!(
            decode("heart_rate#deep#2024-12-15", "60"),
            Err(SampleError::QualifierNotAllowed { .. })
        ));
    }

    #[test]
    fn test_decode_missing_field() {
        let mut image = ChangeEvent::sample(EventKind::Insert, "u1", "spo2#NA#2024-12-15", "97", "%")
            .dynamodb
            .new_image
            .unwrap();
        image.remove(UNIT);
        assert_eq!(RawSample::decode(&image), Err(SampleError::MissingField(UNIT)));
    }

    #[test]
    fn test_event_kinds_from_json() {
        let json = r#"{"eventName": "REMOVE"}"#;
        let event: ChangeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Remove);
        assert!(!event.is_upsert());

        let json = r#"{"eventName": "TTL_EXPIRED"}"#;
        let event: ChangeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Other);
    }

    #[test]
    fn test_number_attributes_are_accepted() {
        let json = r#"{
            "eventName": "MODIFY",
            "dynamodb": {"NewImage": {
                "userid": {"S": "u1"},
                "hd-context-time": {"S": "step_count#NA#2024-12-15 08:00:00"},
                "quantity": {"N": "1200"},
                "unit": {"S": "count"}
            }}
        }"#;
        let event: ChangeEvent = serde_json::from_str(json).unwrap();
        assert!(event.is_upsert());
        let sample = RawSample::decode(event.dynamodb.new_image.as_ref().unwrap()).unwrap();
        assert_eq!(sample.quantity, Decimal::from(1200));
    }

    #[test]
    fn test_extra_attributes_of_any_type_are_ignored() {
        let json = r#"{
            "eventName": "INSERT",
            "dynamodb": {"NewImage": {
                "userid": {"S": "u1"},
                "hd-context-time": {"S": "step_count#NA#2024-12-15 08:00:00"},
                "quantity": {"N": "1200"},
                "unit": {"S": "count"},
                "synced": {"BOOL": true},
                "note": {"NULL": true},
                "tags": {"SS": ["watch", "wrist"]},
                "device": {"M": {"model": {"S": "band-3"}}}
            }}
        }"#;
        let event: ChangeEvent = serde_json::from_str(json).unwrap();
        let image = event.dynamodb.new_image.as_ref().unwrap();
        assert!(matches!(image.get("synced"), Some(AttributeValue::Other(_))));

        let sample = RawSample::decode(image).unwrap();
        assert_eq!(sample.quantity, Decimal::from(1200));
        assert_eq!(sample.unit, "count");
    }

    #[test]
    fn test_required_attribute_of_unsupported_type() {
        let mut image = ChangeEvent::sample(EventKind::Insert, "u1", "spo2#NA#2024-12-15", "97", "%")
            .dynamodb
            .new_image
            .unwrap();
        image.insert(
            QUANTITY.to_string(),
            AttributeValue::Other(serde_json::json!({"BOOL": true})),
        );
        assert_eq!(
            RawSample::decode(&image),
            Err(SampleError::UnsupportedAttribute(QUANTITY))
        );
    }

    #[test]
    fn test_batch_keeps_records_raw() {
        let json = r#"{"Records": [{"eventName": "INSERT"}, {"bogus": true}]}"#;
        let batch = EventBatch::from_json(json).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_batch_without_records_is_rejected() {
        assert!(EventBatch::from_json("{}").is_err());
        assert!(EventBatch::from_json(r#"{"foo": 1}"#).is_err());
        assert!(EventBatch::from_json(r#"{"Records": []}"#).unwrap().is_empty());
    }
}
