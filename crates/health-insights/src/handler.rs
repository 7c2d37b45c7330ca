//! Request handlers in front of the merge and roll-up engines
//!
//! Callers only ever see a generic success or failure. The cause of a
//! failure is logged, never returned.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::config::MergeConfig;
use crate::error::{InsightsError, Result};
use crate::events::EventBatch;
use crate::merge::{MergeEngine, MergeReport};
use crate::rollup::{RollupEngine, RollupRequest, RollupResponse};
use crate::store::AggregateStore;

pub const AGGREGATION_SUCCEEDED: &str = "Aggregation completed successfully";
pub const PROCESSING_FAILED: &str = "Processing Failed";

/// Field carrying a JSON-encoded request
const BODY: &str = "body";

/// `{"statusCode": .., "body": ".."}` where body is itself JSON text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl StatusEnvelope {
    pub fn ok(body: &impl Serialize) -> Result<Self> {
        Ok(Self {
            status_code: 200,
            body: serde_json::to_string(body)?,
        })
    }

    pub fn failed() -> Self {
        Self {
            status_code: 500,
            body: Value::from(PROCESSING_FAILED).to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// How a roll-up request arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestForm {
    /// Fields at the top level
    Direct,
    /// Fields serialized as a JSON string under `body`
    Wrapped,
}

/// Accept a roll-up request in either form
pub fn parse_rollup_request(raw: &Value) -> Result<(RollupRequest, RequestForm)> {
    let invalid = |e: serde_json::Error| InsightsError::invalid_request(e.to_string());

    match raw.get(BODY) {
        Some(Value::String(body)) => {
            let request = serde_json::from_str(body).map_err(invalid)?;
            Ok((request, RequestForm::Wrapped))
        }
        Some(_) => Err(InsightsError::invalid_request("`body` must be a JSON string")),
        None => {
            let request = RollupRequest::deserialize(raw).map_err(invalid)?;
            Ok((request, RequestForm::Direct))
        }
    }
}

/// Entry point shared by the CLI and embedding services
pub struct Handler {
    merge: MergeEngine,
    rollup: RollupEngine,
}

impl Handler {
    pub fn new(store: Arc<dyn AggregateStore>, config: MergeConfig) -> Self {
        Self {
            merge: MergeEngine::with_config(Arc::clone(&store), config),
            rollup: RollupEngine::new(store),
        }
    }

    /// Merge a change-event batch, returning the full report
    pub async fn merge(&self, raw: &Value) -> Result<MergeReport> {
        let batch = EventBatch::deserialize(raw)
            .map_err(|e| InsightsError::invalid_request(format!("malformed batch: {}", e)))?;
        self.merge.merge_batch(&batch).await
    }

    /// Merge a change-event batch behind the status envelope
    pub async fn aggregate(&self, raw: &Value) -> StatusEnvelope {
        match self.merge(raw).await {
            Ok(_) => StatusEnvelope::ok(&AGGREGATION_SUCCEEDED)
                .unwrap_or_else(|_| StatusEnvelope::failed()),
            Err(e) => {
                error!(error = %e, "aggregation failed");
                StatusEnvelope::failed()
            }
        }
    }

    /// Run a roll-up, returning the typed response and the form it came in
    pub async fn query(&self, raw: &Value) -> Result<(RollupResponse, RequestForm)> {
        let (request, form) = parse_rollup_request(raw)?;
        let response = self.rollup.query(&request).await?;
        Ok((response, form))
    }

    /// Run a roll-up and shape the reply after the request form.
    ///
    /// Direct requests get the response object, wrapped requests get it
    /// inside a status envelope. Failures get the 500 envelope either way.
    pub async fn insights(&self, raw: &Value) -> Value {
        match self.reply(raw).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "roll-up failed");
                failed_value()
            }
        }
    }

    async fn reply(&self, raw: &Value) -> Result<Value> {
        let (response, form) = self.query(raw).await?;
        Ok(match form {
            RequestForm::Direct => serde_json::to_value(&response)?,
            RequestForm::Wrapped => serde_json::to_value(StatusEnvelope::ok(&response)?)?,
        })
    }
}

fn failed_value() -> Value {
    serde_json::json!({
        "statusCode": 500,
        "body": Value::from(PROCESSING_FAILED).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChangeEvent, EventKind};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn handler() -> Handler {
        Handler::new(Arc::new(MemoryStore::new()), MergeConfig::default())
    }

    fn batch(events: &[ChangeEvent]) -> Value {
        serde_json::to_value(EventBatch::from_events(events).unwrap()).unwrap()
    }

    fn request_fields() -> Value {
        json!({
            "insight-type": "W",
            "userid": "u1",
            "hd-context": "heart_rate#NA",
            "fromDate": "2024-12-09",
            "toDate": "2024-12-15"
        })
    }

    #[test]
    fn test_envelopes() {
        let ok = StatusEnvelope::ok(&AGGREGATION_SUCCEEDED).unwrap();
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"statusCode": 200, "body": "\"Aggregation completed successfully\""})
        );
        assert_eq!(
            serde_json::to_value(StatusEnvelope::failed()).unwrap(),
            json!({"statusCode": 500, "body": "\"Processing Failed\""})
        );
        assert_eq!(serde_json::to_value(StatusEnvelope::failed()).unwrap(), failed_value());
    }

    #[test]
    fn test_parse_both_request_forms() {
        let (direct, form) = parse_rollup_request(&request_fields()).unwrap();
        assert_eq!(form, RequestForm::Direct);

        let wrapped = json!({"body": request_fields().to_string()});
        let (from_body, form) = parse_rollup_request(&wrapped).unwrap();
        assert_eq!(form, RequestForm::Wrapped);
        assert_eq!(direct, from_body);
    }

    #[test]
    fn test_parse_rejects_bad_requests() {
        let mut bad_date = request_fields();
        bad_date["fromDate"] = json!("12/09/2024");
        assert!(matches!(
            parse_rollup_request(&bad_date),
            Err(InsightsError::InvalidRequest(_))
        ));

        let object_body = json!({"body": request_fields()});
        assert!(matches!(
            parse_rollup_request(&object_body),
            Err(InsightsError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_aggregate_then_query_both_forms() {
        let handler = handler();
        let envelope = handler
            .aggregate(&batch(&[
                ChangeEvent::sample(EventKind::Insert, "u1", "heart_rate#NA#2024-12-15 10:00:00", "60", "bpm"),
                ChangeEvent::sample(EventKind::Insert, "u1", "heart_rate#NA#2024-12-15 11:00:00", "80", "bpm"),
            ]))
            .await;
        assert!(envelope.is_success());
        assert_eq!(envelope.body, "\"Aggregation completed successfully\"");

        let direct = handler.insights(&request_fields()).await;
        assert_eq!(direct["average"], "70");
        assert_eq!(direct["unit"], "bpm");
        assert_eq!(direct["data"][0]["label"], "15 Dec");

        let wrapped = handler
            .insights(&json!({"body": request_fields().to_string()}))
            .await;
        assert_eq!(wrapped["statusCode"], 200);
        let body: Value = serde_json::from_str(wrapped["body"].as_str().unwrap()).unwrap();
        assert_eq!(body, direct);
    }

    #[tokio::test]
    async fn test_failures_are_generic() {
        let handler = handler();

        let envelope = handler.aggregate(&json!({"Records": "not a list"})).await;
        assert_eq!(envelope, StatusEnvelope::failed());

        for missing_records in [json!({}), json!({"foo": 1})] {
            assert!(matches!(
                handler.merge(&missing_records).await,
                Err(InsightsError::InvalidRequest(_))
            ));
            assert_eq!(handler.aggregate(&missing_records).await, StatusEnvelope::failed());
        }

        let reply = handler.insights(&json!({"userid": "u1"})).await;
        assert_eq!(reply, failed_value());

        let mut unknown_type = request_fields();
        unknown_type["insight-type"] = json!("Q");
        assert_eq!(handler.insights(&unknown_type).await, failed_value());
    }

    #[tokio::test]
    async fn test_malformed_records_still_succeed() {
        let handler = handler();
        let raw = json!({"Records": [
            {"eventName": "INSERT", "dynamodb": {"NewImage": {"userid": {"S": "u1"}}}},
            42
        ]});

        let report = handler.merge(&raw).await.unwrap();
        assert_eq!(report.stats.skipped, 2);
        assert!(handler.aggregate(&raw).await.is_success());
    }
}
