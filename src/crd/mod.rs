//! Custom Resource Definitions for the Celery operator
//!
//! This module contains the CeleryApp CRD and the types shared by its spec
//! and status.

mod celery;
mod types;

pub use celery::{
    CeleryApp, CeleryAppSpec, CeleryAppStatus, DEFAULT_SERVICE_TYPE, MAX_APP_NAME_LEN,
};
pub use types::{
    AppPhase, ChildKind, ChildRef, ChildType, Condition, ConditionStatus, EnvVar, FlowerServiceSpec,
    FlowerSpec, LocalObjectReference, MetricTarget, QueueLength, ResourceQuantity,
    ResourceRequirements, ScaleMetric, ScaleRecord, ScaleTarget, ServicePortSnapshot,
    ServiceSnapshot, WorkerSpec, WriteOrigin, DEFAULT_CONCURRENCY, DEFAULT_FLOWER_REPLICAS,
    DEFAULT_LOG_LEVEL, DEFAULT_NUM_OF_WORKERS, DEFAULT_QUEUES, FLOWER_PORT, WORKER_SCALE_KIND,
};
