//! Merge change-event batches into the aggregate store

use serde_json::Value;
use tracing::error;

use crate::config::Config;
use crate::error::{InsightsError, Result};
use crate::handler::{Handler, StatusEnvelope};

use super::{open_store, read_input};

/// Merge one batch file and print the status envelope
pub async fn aggregate(config: &Config, input: &str) -> Result<()> {
    let text = read_input(input)?;
    let store = open_store(config)?;
    let handler = Handler::new(store, config.merge.clone());

    let envelope = match serde_json::from_str::<Value>(&text) {
        Ok(raw) => handler.aggregate(&raw).await,
        Err(e) => {
            error!(error = %e, input, "batch is not valid JSON");
            StatusEnvelope::failed()
        }
    };

    println!("{}", serde_json::to_string(&envelope)?);

    if envelope.is_success() {
        Ok(())
    } else {
        Err(InsightsError::Internal(format!("aggregation of {} failed", input)))
    }
}
