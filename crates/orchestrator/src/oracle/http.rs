//! HTTP diagnosis oracle
//!
//! Transport only: POSTs the healing request as JSON and parses a
//! `HealingPlan` from the response body.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use medic_core::{DiagnosisOracle, HealingPlan, HealingRequest, OracleError};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpOracle {
    endpoint: String,
    client: Client,
    timeout: Duration,
    api_key: Option<String>,
}

impl HttpOracle {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(anyhow!("Oracle endpoint cannot be empty"));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            endpoint,
            client,
            timeout,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DiagnosisOracle for HttpOracle {
    async fn diagnose(&self, request: &HealingRequest) -> Result<HealingPlan, OracleError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout(self.timeout)
            } else {
                OracleError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Unavailable(format!(
                "oracle responded with status {status}"
            )));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout(self.timeout)
            } else {
                OracleError::Unavailable(e.to_string())
            }
        })?;
        debug!(endpoint = %self.endpoint, bytes = body.len(), "Oracle response received");

        serde_json::from_str(&body).map_err(|e| OracleError::InvalidPlan(e.to_string()))
    }

    fn name(&self) -> &str {
        "http"
    }
}
