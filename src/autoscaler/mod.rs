//! Queue-length autoscaling for Celery workers
//!
//! Two phases, driven from reconcile:
//! - Sampling: ask flower for per-queue pending message counts and record the
//!   result in status. Failures degrade to an empty sample.
//! - Decision: when the recorded sample changes, compute a bounded replica
//!   count for the worker Deployment with a proportional control law:
//!   `desired = ceil(current * queue_length / average_value)` clamped to
//!   `[min_replicas, max_replicas]`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{CeleryAppSpec, ChildRef, QueueLength, ScaleTarget};
use crate::registry::ChildRegistry;
use crate::Error;

/// Path of flower's queue length endpoint
pub const QUEUE_LENGTH_PATH: &str = "/api/queues/length";

/// Trait abstracting the flower monitoring API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FlowerClient: Send + Sync {
    /// Fetch pending message counts per active queue
    ///
    /// # Arguments
    ///
    /// * `endpoint` - `host:port` of the flower Service
    async fn queue_lengths(&self, endpoint: &str) -> Result<Vec<QueueLength>, Error>;
}

#[derive(Debug, Deserialize)]
struct QueueLengthResponse {
    #[serde(default)]
    active_queues: Vec<QueueLength>,
}

/// Real flower client over HTTP
pub struct HttpFlowerClient {
    http: reqwest::Client,
}

impl HttpFlowerClient {
    /// Create a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::monitoring(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl FlowerClient for HttpFlowerClient {
    async fn queue_lengths(&self, endpoint: &str) -> Result<Vec<QueueLength>, Error> {
        let url = format!("http://{endpoint}{QUEUE_LENGTH_PATH}");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::monitoring(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::monitoring(format!("GET {url}: HTTP {status}")));
        }

        let body: QueueLengthResponse = response
            .json()
            .await
            .map_err(|e| Error::monitoring(format!("GET {url}: invalid body: {e}")))?;
        Ok(body.active_queues)
    }
}

/// Sample queue lengths, degrading any failure to an empty sample
pub async fn sample(flower: &dyn FlowerClient, endpoint: &str) -> Vec<QueueLength> {
    match flower.queue_lengths(endpoint).await {
        Ok(queues) => {
            debug!(endpoint, queues = queues.len(), "sampled flower queues");
            queues
        }
        Err(e) => {
            warn!(endpoint, error = %e, "flower unavailable, recording empty sample");
            Vec::new()
        }
    }
}

/// Returns true if a new sample should be taken
pub fn sampling_due(
    last_sampled_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval: Duration,
) -> bool {
    match last_sampled_at {
        None => true,
        // Future timestamps (clock skew) count as due
        Some(last) => (now - last).to_std().map_or(true, |elapsed| elapsed >= interval),
    }
}

/// Time left until the next sample is due
pub fn until_next_sample(
    last_sampled_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval: Duration,
) -> Duration {
    last_sampled_at
        .and_then(|last| (now - last).to_std().ok())
        .map_or(Duration::ZERO, |elapsed| interval.saturating_sub(elapsed))
}

/// Bounded replica count for a worker pool
///
/// Integral averages divide exactly in integer arithmetic; fractional ones
/// fall back to floating point. The result is always within `[min, max]`
/// when `min <= max`.
pub fn desired_replicas(
    current: u32,
    queue_length: u64,
    average_value: f64,
    min: u32,
    max: u32,
) -> u32 {
    let load = u128::from(current) * u128::from(queue_length);
    let average = average_value.max(f64::MIN_POSITIVE);
    let raw = if average.fract() == 0.0 && average < u64::MAX as f64 {
        load.div_ceil(average as u128) as f64
    } else {
        (load as f64 / average).ceil()
    };
    raw.max(f64::from(min)).min(f64::from(max)) as u32
}

/// Evaluate one worker scale target
///
/// `default_min` applies only when the target has no `minReplicas` at all.
pub fn evaluate_target(
    target: &ScaleTarget,
    current: u32,
    queue_length: u64,
    default_min: u32,
) -> Result<u32, Error> {
    let max = target
        .max_replicas
        .ok_or_else(|| Error::invalid_scale_target("maxReplicas is required"))?;
    let average = target.average_value()?;
    let min = target.min_replicas.unwrap_or(default_min);
    if min > max {
        return Err(Error::invalid_scale_target(format!(
            "minReplicas {min} exceeds maxReplicas {max}"
        )));
    }

    Ok(desired_replicas(current, queue_length, average, min, max))
}

/// Replica count to apply to a Deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleDecision {
    /// Deployment to patch
    pub deployment_name: String,
    /// Replica count to apply
    pub replicas: u32,
}

/// Result of evaluating every scale target against one sample
#[derive(Debug, Default)]
pub struct ScalePlan {
    /// Last valid decision, if any
    pub decision: Option<ScaleDecision>,
    /// Targets that could not be evaluated, by position
    pub rejected: Vec<(usize, Error)>,
}

/// Evaluate all worker scale targets against a single queue sample
///
/// Non-worker targets are ignored. Invalid targets are collected and skipped;
/// the last valid decision wins. An empty sample carries no signal and
/// produces no decision.
pub fn plan_scale(
    spec: &CeleryAppSpec,
    children: &[ChildRef],
    sample: &[QueueLength],
) -> Result<ScalePlan, Error> {
    let mut plan = ScalePlan::default();
    if sample.is_empty() {
        return Ok(plan);
    }

    let worker_targets: Vec<(usize, &ScaleTarget)> = spec
        .scale_targets()
        .iter()
        .enumerate()
        .filter(|(idx, target)| {
            if !target.is_worker() {
                debug!(index = idx, kind = %target.kind, "ignoring non-worker scale target");
            }
            target.is_worker()
        })
        .collect();
    if worker_targets.is_empty() {
        return Ok(plan);
    }

    let worker = ChildRegistry::new(children).worker_deployment()?;
    let current = worker
        .replicas
        .unwrap_or_else(|| spec.worker_spec.replicas());
    let queue_length = sample
        .iter()
        .find(|q| q.name == spec.worker_spec.queues())
        .map_or(0, |q| q.messages);

    for (idx, target) in worker_targets {
        match evaluate_target(target, current, queue_length, spec.worker_spec.replicas()) {
            Ok(replicas) => {
                plan.decision = Some(ScaleDecision {
                    deployment_name: worker.name.clone(),
                    replicas,
                });
            }
            Err(e) => {
                warn!(index = idx, error = %e, "skipping scale target");
                plan.rejected.push((idx, e));
            }
        }
    }

    Ok(plan)
}
