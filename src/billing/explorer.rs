use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use ureq::Agent;

use super::{BillingSource, CostAndUsageQuery, CostAndUsageResponse};

/// Posts the query as JSON to a cost-and-usage gateway and reads back the
/// provider-shaped response.
pub struct HttpBillingSource {
    agent: Agent,
    endpoint: String,
}

impl HttpBillingSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: Agent::new_with_config(config),
            endpoint: endpoint.into(),
        }
    }
}

impl BillingSource for HttpBillingSource {
    fn query_cost_and_usage(&self, query: &CostAndUsageQuery) -> Result<CostAndUsageResponse> {
        let payload = serde_json::to_string(query)?;
        info!(endpoint = %self.endpoint, "querying cost and usage");
        let body = self
            .agent
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .send(payload.as_str())
            .with_context(|| format!("billing source unreachable at {}", self.endpoint))?
            .body_mut()
            .read_to_string()
            .context("Failed to read billing response")?;
        serde_json::from_str(&body).context("Failed to parse billing response")
    }
}

/// Reads a previously saved cost-and-usage response, e.g. the JSON written by
/// `aws ce get-cost-and-usage`. The query is only used for logging.
pub struct FileBillingSource {
    path: PathBuf,
}

impl FileBillingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BillingSource for FileBillingSource {
    fn query_cost_and_usage(&self, query: &CostAndUsageQuery) -> Result<CostAndUsageResponse> {
        info!(
            path = %self.path.display(),
            start = %query.time_period.start,
            "reading saved billing response"
        );
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse billing response in {}", self.path.display()))
    }
}
