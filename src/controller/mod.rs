//! Controller for CeleryApp resources
//!
//! [`reconcile`] drives an app toward its spec: children are created once,
//! refreshed by name when the spec changes, and the worker pool is resized
//! from flower queue samples.

mod celery;
mod reconciler;

pub use celery::{
    error_policy, reconcile, Context, ContextBuilder, ControllerConfig, KubeClient,
    KubeClientImpl, CONTROLLER_NAME,
};
pub use reconciler::{apply_scale, create_children, update_children};

#[cfg(test)]
pub use celery::MockKubeClient;
