//! Simulated workers for the demo population
//!
//! Each flavour fails at a configurable rate and accepts a `failure_rate`
//! patch, so a diagnosis that prescribes APPLY_PATCH has a visible effect.

use async_trait::async_trait;
use medic_core::{PatchRejected, Task, TaskError, TaskOutput, Worker};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

fn roll(rate: f64) -> bool {
    rand::rng().random_bool(rate.clamp(0.0, 1.0))
}

fn patched_rate(payload: &Value) -> Result<Option<f64>, PatchRejected> {
    match payload.get("failure_rate") {
        None => Ok(None),
        Some(value) => match value.as_f64() {
            Some(rate) if (0.0..=1.0).contains(&rate) => Ok(Some(rate)),
            _ => Err(PatchRejected::new(format!(
                "failure_rate must be a number within 0..=1, got {value}"
            ))),
        },
    }
}

fn numbers(payload: &Value) -> Vec<f64> {
    payload
        .get("metrics")
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

/// Record transformer: transform, validate, analyze and clean operations
pub struct DataProcessor {
    failure_rate: Mutex<f64>,
    processed: Mutex<u64>,
}

impl DataProcessor {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: Mutex::new(failure_rate),
            processed: Mutex::new(0),
        }
    }

    pub fn failure_rate(&self) -> f64 {
        *self.failure_rate.lock()
    }

    fn transform(record: &Map<String, Value>) -> Value {
        record
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => Value::String(s.to_uppercase()),
                    other => other.clone(),
                };
                (k.clone(), v)
            })
            .collect::<Map<_, _>>()
            .into()
    }

    fn validate(record: &Map<String, Value>) -> Value {
        let missing: Vec<&str> = ["id", "timestamp"]
            .into_iter()
            .filter(|field| !record.contains_key(*field))
            .collect();
        json!({ "valid": missing.is_empty(), "missing_fields": missing })
    }

    fn analyze(record: &Map<String, Value>) -> Value {
        json!({
            "field_count": record.len(),
            "has_nested": record.values().any(|v| v.is_object() || v.is_array()),
        })
    }

    fn clean(record: &Map<String, Value>) -> Value {
        record
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Map<_, _>>()
            .into()
    }
}

#[async_trait]
impl Worker for DataProcessor {
    async fn execute(&self, task: &Task) -> Result<TaskOutput, TaskError> {
        let operation = task.kind.as_str();
        if roll(self.failure_rate()) {
            return Err(TaskError::Other(format!(
                "Data processing failed: simulated error in {operation}"
            )));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;

        let record = task
            .payload
            .as_object()
            .ok_or_else(|| TaskError::Logic("record payload is not an object".into()))?;
        let result = match operation {
            "transform" => Self::transform(record),
            "validate" => Self::validate(record),
            "analyze" => Self::analyze(record),
            "clean" => Self::clean(record),
            other => return Err(TaskError::Logic(format!("unknown operation '{other}'"))),
        };

        let total = {
            let mut processed = self.processed.lock();
            *processed += 1;
            *processed
        };
        Ok(json!({ "operation": operation, "result": result, "total_processed": total }))
    }

    async fn apply_patch(&self, payload: &Value) -> Result<(), PatchRejected> {
        let rate = patched_rate(payload)?
            .ok_or_else(|| PatchRejected::new("data processor only accepts failure_rate"))?;
        *self.failure_rate.lock() = rate;
        Ok(())
    }
}

struct GatewayState {
    failure_rate: f64,
    rate_limit: u32,
    window_started: Instant,
    per_client: HashMap<String, u32>,
    requests: u64,
}

/// Request router with a per-client rate limit over a fixed window
pub struct ApiGateway {
    state: Mutex<GatewayState>,
    window: Duration,
}

impl ApiGateway {
    pub fn new(failure_rate: f64, rate_limit: u32) -> Self {
        Self {
            state: Mutex::new(GatewayState {
                failure_rate,
                rate_limit,
                window_started: Instant::now(),
                per_client: HashMap::new(),
                requests: 0,
            }),
            window: Duration::from_secs(1),
        }
    }

    pub fn rate_limit(&self) -> u32 {
        self.state.lock().rate_limit
    }

    /// Count the request against its client. Returns the request number, or
    /// the rate limit error.
    fn admit(&self, client_id: &str) -> Result<(u64, f64), TaskError> {
        let mut state = self.state.lock();
        if state.window_started.elapsed() >= self.window {
            state.window_started = Instant::now();
            state.per_client.clear();
        }

        let limit = state.rate_limit;
        let count = state.per_client.entry(client_id.to_string()).or_insert(0);
        *count += 1;
        if *count > limit {
            return Err(TaskError::Other(format!(
                "Rate limit exceeded for client: {client_id}"
            )));
        }

        state.requests += 1;
        Ok((state.requests, state.failure_rate))
    }
}

#[async_trait]
impl Worker for ApiGateway {
    async fn execute(&self, task: &Task) -> Result<TaskOutput, TaskError> {
        let client_id = task
            .payload
            .get("client_id")
            .and_then(Value::as_str)
            .unwrap_or("default");
        let endpoint = task
            .payload
            .get("endpoint")
            .and_then(Value::as_str)
            .unwrap_or("/");

        let (request, failure_rate) = self.admit(client_id)?;
        tokio::time::sleep(Duration::from_millis(5)).await;

        if roll(failure_rate) {
            return Err(TaskError::Io(
                "API Gateway timeout: Backend service unavailable".into(),
            ));
        }

        Ok(json!({
            "endpoint": endpoint,
            "status": "success",
            "request_id": format!("req_{request:06}"),
            "client_id": client_id,
        }))
    }

    async fn apply_patch(&self, payload: &Value) -> Result<(), PatchRejected> {
        let rate = patched_rate(payload)?;
        let limit = match payload.get("rate_limit") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .filter(|limit| *limit >= 1)
                    .and_then(|limit| u32::try_from(limit).ok())
                    .ok_or_else(|| {
                        PatchRejected::new(format!("rate_limit must be a positive integer, got {value}"))
                    })?,
            ),
        };
        if rate.is_none() && limit.is_none() {
            return Err(PatchRejected::new(
                "gateway accepts failure_rate and rate_limit",
            ));
        }

        let mut state = self.state.lock();
        if let Some(rate) = rate {
            state.failure_rate = rate;
        }
        if let Some(limit) = limit {
            state.rate_limit = limit;
            state.per_client.clear();
        }
        Ok(())
    }
}

/// Report generator over numeric metric series
pub struct Analytics {
    failure_rate: Mutex<f64>,
}

impl Analytics {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: Mutex::new(failure_rate),
        }
    }

    fn summary(values: &[f64]) -> Value {
        let total: f64 = values.iter().sum();
        let count = values.len();
        json!({
            "total": total,
            "average": if count > 0 { total / count as f64 } else { 0.0 },
            "count": count,
            "max": values.iter().copied().reduce(f64::max),
            "min": values.iter().copied().reduce(f64::min),
        })
    }

    fn trend(values: &[f64]) -> Value {
        match (values.first(), values.last()) {
            (Some(first), Some(last)) if values.len() > 1 => {
                let trend = if last > first { "increasing" } else { "decreasing" };
                let change = if *first != 0.0 {
                    (last - first) / first * 100.0
                } else {
                    0.0
                };
                json!({ "trend": trend, "change_percentage": change, "data_points": values.len() })
            }
            _ => json!({ "trend": "stable", "change_percentage": 0.0, "data_points": values.len() }),
        }
    }

    fn anomalies(values: &[f64]) -> Value {
        if values.len() < 2 {
            return json!({ "anomalies": [], "threshold": null });
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let threshold = mean + 2.0 * variance.sqrt();
        let anomalies: Vec<f64> = values.iter().copied().filter(|v| *v > threshold).collect();
        json!({ "anomalies": anomalies, "threshold": threshold })
    }
}

#[async_trait]
impl Worker for Analytics {
    async fn execute(&self, task: &Task) -> Result<TaskOutput, TaskError> {
        if roll(*self.failure_rate.lock()) {
            return Err(TaskError::ResourceExhausted(
                "analytics working set exceeded memory quota".into(),
            ));
        }

        tokio::time::sleep(Duration::from_millis(8)).await;

        let values = numbers(&task.payload);
        let report = match task.kind.as_str() {
            "summary" => Self::summary(&values),
            "trend" => Self::trend(&values),
            "anomaly" => Self::anomalies(&values),
            other => return Err(TaskError::Logic(format!("unknown report type '{other}'"))),
        };
        Ok(json!({ "report_type": task.kind, "report": report }))
    }

    async fn apply_patch(&self, payload: &Value) -> Result<(), PatchRejected> {
        let rate = patched_rate(payload)?
            .ok_or_else(|| PatchRejected::new("analytics only accepts failure_rate"))?;
        *self.failure_rate.lock() = rate;
        Ok(())
    }
}
