//! Shared types for the CeleryApp CRD spec and status

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::{Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Default number of worker replicas when `numOfWorkers` is omitted
pub const DEFAULT_NUM_OF_WORKERS: u32 = 1;
/// Default queue consumed by workers when `queues` is omitted
pub const DEFAULT_QUEUES: &str = "celery";
/// Default worker log level when `logLevel` is omitted
pub const DEFAULT_LOG_LEVEL: &str = "info";
/// Default worker concurrency when `concurrency` is omitted
pub const DEFAULT_CONCURRENCY: u32 = 1;
/// Default number of flower replicas when `replicas` is omitted
pub const DEFAULT_FLOWER_REPLICAS: u32 = 1;
/// Port flower listens on inside its container
pub const FLOWER_PORT: u16 = 5555;
/// Scale target kind that drives the worker Deployment
pub const WORKER_SCALE_KIND: &str = "worker";

// =============================================================================
// Spec types
// =============================================================================

/// Compute resource quantities (cpu, memory)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantity {
    /// CPU quantity (e.g. "500m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity (e.g. "256Mi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Container resource requests and limits
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Minimum resources the scheduler reserves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantity>,
    /// Hard ceiling enforced by the kubelet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantity>,
}

/// Environment variable passed to a container
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Reference to a Secret in the parent's namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Secret name
    pub name: String,
}

/// Celery worker configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    /// Initial replica count, also the autoscaling floor when a target omits `minReplicas`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_of_workers: Option<u32>,
    /// Comma-separated queue names passed to `--queues`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queues: Option<String>,
    /// Worker log level passed to `--loglevel`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Worker pool size passed to `--concurrency`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Container resources (required)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Extra arguments appended after the generated worker arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    /// Node selector for worker pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
}

impl WorkerSpec {
    /// Configured worker replicas
    pub fn replicas(&self) -> u32 {
        self.num_of_workers.unwrap_or(DEFAULT_NUM_OF_WORKERS)
    }

    /// Queues consumed by the workers
    pub fn queues(&self) -> &str {
        self.queues.as_deref().unwrap_or(DEFAULT_QUEUES)
    }

    /// Worker log level
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Worker concurrency
    pub fn concurrency(&self) -> u32 {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }
}

/// How the flower Service is exposed
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlowerServiceSpec {
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Port exposed by the Service, forwarded to flower's container port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Flower monitoring configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowerSpec {
    /// Flower replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// Container resources (required)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Extra arguments appended after `--app=<app> flower`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    /// Node selector for flower pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Service exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<FlowerServiceSpec>,
}

impl FlowerSpec {
    /// Configured flower replicas
    pub fn replicas(&self) -> u32 {
        self.replicas.unwrap_or(DEFAULT_FLOWER_REPLICAS)
    }

    /// Port exposed by the flower Service
    pub fn service_port(&self) -> u16 {
        self.service
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(FLOWER_PORT)
    }
}

/// Desired average of a metric per replica
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    /// Desired queue length per worker replica, a number or numeric string
    ///
    /// Kept untyped so a bad value invalidates only its own target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "metric_value_schema")]
    pub average_value: Option<Value>,
}

fn metric_value_schema(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject::default();
    schema.metadata().description =
        Some("Desired queue length per worker replica (number)".to_string());
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Metric driving a scale target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleMetric {
    /// Target value for the metric
    pub target: MetricTarget,
}

/// Queue-length autoscaling target
///
/// Only kind `worker` is acted on; other kinds are accepted and ignored.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTarget {
    /// Which child the target scales
    pub kind: String,
    /// Replica floor, defaults to `workerSpec.numOfWorkers`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,
    /// Replica ceiling (required for evaluation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
    /// Metrics; the first entry's target is used
    #[serde(default)]
    pub metrics: Vec<ScaleMetric>,
}

impl ScaleTarget {
    /// Returns true if this target scales the worker Deployment
    pub fn is_worker(&self) -> bool {
        self.kind == WORKER_SCALE_KIND
    }

    /// Desired average queue length from the first metric
    ///
    /// Fractional values are allowed; the value must be finite and positive.
    pub fn average_value(&self) -> Result<f64> {
        let raw = self
            .metrics
            .first()
            .and_then(|m| m.target.average_value.as_ref())
            .ok_or_else(|| {
                Error::invalid_scale_target("metrics[0].target.averageValue is required")
            })?;
        let average = match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            Error::invalid_scale_target(format!("averageValue must be a number, got {raw}"))
        })?;

        if !(average.is_finite() && average > 0.0) {
            return Err(Error::invalid_scale_target(format!(
                "averageValue must be positive, got {average}"
            )));
        }
        Ok(average)
    }
}

// =============================================================================
// Status types
// =============================================================================

/// Kubernetes kind of a managed child
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ChildKind {
    /// apps/v1 Deployment
    Deployment,
    /// v1 Service
    Service,
}

impl std::fmt::Display for ChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deployment => write!(f, "Deployment"),
            Self::Service => write!(f, "Service"),
        }
    }
}

/// Role a child plays for the Celery application
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ChildType {
    /// Celery worker pool
    Worker,
    /// Flower monitoring
    Flower,
}

impl std::fmt::Display for ChildType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker => write!(f, "Worker"),
            Self::Flower => write!(f, "Flower"),
        }
    }
}

/// Which reconciliation path last wrote a child record
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteOrigin {
    /// Recorded when the parent was created
    #[default]
    Create,
    /// Recorded by a later update or scale
    Update,
}

/// Port recorded for the flower Service
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortSnapshot {
    /// Port name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Service port
    pub port: u16,
}

/// Service spec as last returned by the API server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    /// Service type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Exposed ports
    #[serde(default)]
    pub ports: Vec<ServicePortSnapshot>,
}

/// Identity of a managed child as recorded in status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChildRef {
    /// Live object name
    pub name: String,
    /// Kubernetes kind
    pub kind: ChildKind,
    /// Role of the child
    #[serde(rename = "type")]
    pub type_: ChildType,
    /// Replica count reported by the API server (Deployments only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// Service spec snapshot (Services only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ServiceSnapshot>,
    /// Path that last wrote this record
    #[serde(default)]
    pub recorded_by: WriteOrigin,
    /// Status revision at which this record was written
    #[serde(default)]
    pub revision: u64,
}

impl ChildRef {
    /// Record a Deployment child
    pub fn deployment(name: impl Into<String>, type_: ChildType, replicas: Option<u32>) -> Self {
        Self {
            name: name.into(),
            kind: ChildKind::Deployment,
            type_,
            replicas,
            spec: None,
            recorded_by: WriteOrigin::Create,
            revision: 0,
        }
    }

    /// Record the flower Service child
    pub fn service(name: impl Into<String>, spec: ServiceSnapshot) -> Self {
        Self {
            name: name.into(),
            kind: ChildKind::Service,
            type_: ChildType::Flower,
            replicas: None,
            spec: Some(spec),
            recorded_by: WriteOrigin::Create,
            revision: 0,
        }
    }

    /// Stamp which path wrote this record and at which revision
    pub fn written(mut self, origin: WriteOrigin, revision: u64) -> Self {
        self.recorded_by = origin;
        self.revision = revision;
        self
    }

    /// Returns true if this record is for the given (kind, type) pair
    pub fn is(&self, kind: ChildKind, type_: ChildType) -> bool {
        self.kind == kind && self.type_ == type_
    }
}

/// Pending message count for one queue, as reported by flower
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueLength {
    /// Queue name
    pub name: String,
    /// Pending messages
    pub messages: u64,
}

/// Outcome of the last autoscaling decision
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRecord {
    /// Queue sample the decision was computed from
    pub sample: Vec<QueueLength>,
    /// Deployment that was patched, if any target produced a decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    /// Replica count applied, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
}

/// Lifecycle phase of a CeleryApp
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AppPhase {
    /// Children have not been created yet
    #[default]
    Pending,
    /// All three children were created
    Created,
    /// Children were refreshed after a spec change
    Updated,
    /// The spec is invalid
    Failed,
}

impl std::fmt::Display for AppPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Created => write!(f, "Created"),
            Self::Updated => write!(f, "Updated"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}
