//! Celery operator - runs Celery worker pools and Flower on Kubernetes
//!
//! A `CeleryApp` custom resource describes one Celery application. The
//! operator materializes it as a worker Deployment, a flower Deployment and a
//! flower Service, keeps them in step with spec edits, and resizes the worker
//! pool from queue lengths reported by flower.
//!
//! # Modules
//!
//! - [`crd`] - The CeleryApp custom resource, its spec normalization and status
//! - [`changes`] - Structural spec diffing and change classification
//! - [`registry`] - Child identity resolution from status
//! - [`workload`] - Desired Deployment and Service construction
//! - [`controller`] - Reconciliation loop
//! - [`autoscaler`] - Flower sampling and the replica control law
//! - [`events`] - Kubernetes Event publishing
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod autoscaler;
pub mod changes;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod registry;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
