//! Roll-up queries and stored aggregate lookups

use serde_json::Value;
use tracing::error;

use crate::config::Config;
use crate::error::{InsightsError, Result};
use crate::handler::Handler;
use crate::models::parse_date;
use crate::rollup::{Granularity, RollupEngine, RollupRequest};
use crate::store::AggregateStore;

use super::{open_store, read_input};

/// Run a roll-up from command-line arguments
pub async fn insights(
    config: &Config,
    user_id: String,
    context: String,
    from: &str,
    to: &str,
    insight_type: &str,
) -> Result<()> {
    let request = RollupRequest {
        granularity: insight_type.parse::<Granularity>()?,
        user_id,
        context,
        from: parse_date(from)?,
        to: parse_date(to)?,
    };

    let engine = RollupEngine::new(open_store(config)?);
    let response = engine.query(&request).await?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Answer a raw roll-up request exactly as an embedding service would
pub async fn handle(config: &Config, input: &str) -> Result<()> {
    let text = read_input(input)?;
    let raw: Value = serde_json::from_str(&text).map_err(|e| {
        error!(error = %e, input, "request is not valid JSON");
        InsightsError::invalid_request(format!("{} is not valid JSON", input))
    })?;

    let handler = Handler::new(open_store(config)?, config.merge.clone());
    let reply = handler.insights(&raw).await;

    println!("{}", serde_json::to_string_pretty(&reply)?);

    if reply.get("statusCode").and_then(Value::as_u64) == Some(500) {
        return Err(InsightsError::Internal(format!("request in {} failed", input)));
    }
    Ok(())
}

/// Print one stored aggregate
pub async fn show(config: &Config, user_id: &str, metric_code: &str) -> Result<()> {
    let store = open_store(config)?;

    match store.get(user_id, metric_code).await? {
        Some(record) => {
            println!("{:<20} {}", "User:", record.user_id);
            println!("{:<20} {}", "Metric code:", record.metric_code);
            println!("{:<20} {} {}", "Quantity:", record.quantity.normalize(), record.unit);
            match record.referred_count {
                Some(count) => println!("{:<20} {}", "Referred count:", count),
                None => println!("{:<20} -", "Referred count:"),
            }
            println!("{:<20} {}", "Version:", record.version);
        }
        None => println!("No aggregate found for {} / {}", user_id, metric_code),
    }

    Ok(())
}
