//! CeleryApp controller implementation
//!
//! Each reconciliation:
//! 1. validates the spec (invalid specs park in `Failed` until edited),
//! 2. creates the children once, or refreshes the ones a spec change affects,
//! 3. acts on a queue sample that has not been handled yet,
//! 4. samples flower when the sampling interval has elapsed,
//!
//! then writes a single status patch describing what was applied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment as ApiDeployment;
use k8s_openapi::api::core::v1::{ObjectReference, Service as ApiService};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::reconciler::{apply_scale, create_children, update_children};
use crate::autoscaler::{self, FlowerClient, HttpFlowerClient};
use crate::changes::{ChangeSet, RefreshPlan};
use crate::crd::{
    AppPhase, CeleryApp, CeleryAppStatus, Condition, ConditionStatus, ScaleRecord,
    ServicePortSnapshot, ServiceSnapshot,
};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::registry::ChildRegistry;
use crate::workload::{Deployment, DeploymentPatch, DeploymentState, Service, ServiceState};
use crate::Error;

/// Field manager and event reporter name
pub const CONTROLLER_NAME: &str = "celery-operator";

/// Trait abstracting Kubernetes client operations for CeleryApp children
///
/// Creates are create-or-adopt: an object that already exists under the
/// same name is reattached when it has no controller or is already ours.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Create a Deployment, adopting an orphan with the same name
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<DeploymentState, Error>;

    /// Create a Service, adopting an orphan with the same name
    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<ServiceState, Error>;

    /// Merge-patch a Deployment
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &DeploymentPatch,
    ) -> Result<DeploymentState, Error>;

    /// Read a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceState, Error>;

    /// Merge-patch the status subresource of a CeleryApp from `previous` to `status`
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        previous: &CeleryAppStatus,
        status: &CeleryAppStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<DeploymentState, Error> {
        let api: Api<ApiDeployment> = Api::namespaced(self.client.clone(), namespace);
        let body: ApiDeployment = to_api_object(deployment)?;
        let name = &deployment.metadata.name;

        match api.create(&PostParams::default(), &body).await {
            Ok(created) => Ok(deployment_state(&created)),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let existing = api.get(name).await?;
                let owners = existing
                    .metadata
                    .owner_references
                    .as_deref()
                    .unwrap_or_default();
                let desired = &deployment.metadata.owner_references;
                let Some(owner_refs) = adoption_owners("Deployment", name, owners, desired)? else {
                    debug!(%name, "deployment already owned");
                    return Ok(deployment_state(&existing));
                };

                info!(%name, "adopting existing deployment");
                let patch = serde_json::json!({
                    "metadata": { "ownerReferences": owner_refs },
                    "spec": {
                        "replicas": deployment.spec.replicas,
                        "template": {
                            "spec": { "containers": deployment.spec.template.spec.containers }
                        }
                    }
                });
                let adopted = api
                    .patch(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
                    .await?;
                Ok(deployment_state(&adopted))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<ServiceState, Error> {
        let api: Api<ApiService> = Api::namespaced(self.client.clone(), namespace);
        let body: ApiService = to_api_object(service)?;
        let name = &service.metadata.name;

        match api.create(&PostParams::default(), &body).await {
            Ok(created) => Ok(service_state(&created)),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let existing = api.get(name).await?;
                let owners = existing
                    .metadata
                    .owner_references
                    .as_deref()
                    .unwrap_or_default();
                let desired = &service.metadata.owner_references;
                let Some(owner_refs) = adoption_owners("Service", name, owners, desired)? else {
                    debug!(%name, "service already owned");
                    return Ok(service_state(&existing));
                };

                info!(%name, "adopting existing service");
                let patch = serde_json::json!({
                    "metadata": { "ownerReferences": owner_refs }
                });
                let adopted = api
                    .patch(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
                    .await?;
                Ok(service_state(&adopted))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &DeploymentPatch,
    ) -> Result<DeploymentState, Error> {
        let api: Api<ApiDeployment> = Api::namespaced(self.client.clone(), namespace);
        let patched = api
            .patch(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(patch))
            .await?;
        Ok(deployment_state(&patched))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceState, Error> {
        let api: Api<ApiService> = Api::namespaced(self.client.clone(), namespace);
        Ok(service_state(&api.get(name).await?))
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        previous: &CeleryAppStatus,
        status: &CeleryAppStatus,
    ) -> Result<(), Error> {
        let api: Api<CeleryApp> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = status.merge_patch_from(previous)?;

        api.patch_status(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&status_patch))
            .await?;

        Ok(())
    }
}

fn to_api_object<T: DeserializeOwned>(body: &impl Serialize) -> Result<T, Error> {
    serde_json::to_value(body)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization(e.to_string()))
}

fn deployment_state(deployment: &ApiDeployment) -> DeploymentState {
    DeploymentState {
        name: deployment.name_any(),
        replicas: deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .and_then(|r| u32::try_from(r).ok()),
    }
}

fn service_state(service: &ApiService) -> ServiceState {
    let spec = service.spec.as_ref();
    ServiceState {
        name: service.name_any(),
        spec: ServiceSnapshot {
            type_: spec.and_then(|s| s.type_.clone()),
            ports: spec
                .and_then(|s| s.ports.as_ref())
                .map(|ports| {
                    ports
                        .iter()
                        .filter_map(|p| {
                            Some(ServicePortSnapshot {
                                name: p.name.clone(),
                                port: u16::try_from(p.port).ok()?,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
        },
    }
}

/// Owner references to write when adopting an existing object
///
/// Returns `None` when the object is already controlled by `desired`'s
/// controller, the merged owner list when it has no controller, and a
/// conflict when someone else controls it.
pub(crate) fn adoption_owners(
    kind: &str,
    name: &str,
    existing: &[OwnerReference],
    desired: &[OwnerReference],
) -> Result<Option<Vec<OwnerReference>>, Error> {
    let Some(ours) = desired.iter().find(|o| o.controller == Some(true)) else {
        return Err(Error::conflict(format!(
            "{kind} {name} has no controller owner to adopt with"
        )));
    };

    match existing.iter().find(|o| o.controller == Some(true)) {
        Some(current) if current.uid == ours.uid => Ok(None),
        Some(current) => Err(Error::conflict(format!(
            "{kind} {name} is controlled by {} {}",
            current.kind, current.name
        ))),
        None => {
            let mut owners: Vec<OwnerReference> = existing
                .iter()
                .filter(|o| o.uid != ours.uid)
                .cloned()
                .collect();
            owners.push(ours.clone());
            Ok(Some(owners))
        }
    }
}

/// Controller tuning knobs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Minimum time between flower samples
    pub sample_interval: Duration,
    /// Timeout for a single flower request
    pub flower_timeout: Duration,
    /// Requeue delay after a retryable error
    pub error_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            flower_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(ControllerConfig::default())
///     .build()?;
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Flower monitoring client
    pub flower: Arc<dyn FlowerClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Tuning knobs
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        flower: Arc<dyn FlowerClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            flower,
            events,
            config: ControllerConfig::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    flower: Option<Arc<dyn FlowerClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            flower: None,
            events: None,
            config: ControllerConfig::default(),
        }
    }

    /// Set the tuning knobs
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the flower client
    pub fn flower_client(mut self, flower: Arc<dyn FlowerClient>) -> Self {
        self.flower = Some(flower);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let flower: Arc<dyn FlowerClient> = match self.flower {
            Some(flower) => flower,
            None => Arc::new(HttpFlowerClient::new(self.config.flower_timeout)?),
        };

        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            flower,
            events: self
                .events
                .unwrap_or_else(|| {
                    Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))
                }),
            config: self.config,
        })
    }
}

/// Reconcile a CeleryApp resource
#[instrument(skip(app, ctx), fields(app = %app.name_any()))]
pub async fn reconcile(app: Arc<CeleryApp>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = app.name_any();
    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
    let object_ref = app.object_ref(&());
    let current = app.status.clone().unwrap_or_default();
    info!("reconciling celery app");

    if let Err(e) = app.spec.validate() {
        warn!(error = %e, "celery app validation failed");
        let message = e.to_string();
        if current.phase != AppPhase::Failed || current.message.as_deref() != Some(message.as_str()) {
            ctx.events
                .publish(
                    &object_ref,
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    Some(message.clone()),
                )
                .await;
            let status = current
                .clone()
                .phase(AppPhase::Failed)
                .message(message.clone())
                .condition(Condition::new(
                    "Ready",
                    ConditionStatus::False,
                    "ValidationFailed",
                    message,
                ));
            ctx.kube
                .patch_status(&namespace, &name, &current, &status)
                .await?;
        }
        return Ok(Action::await_change());
    }

    let result = converge(&app, &namespace, &object_ref, current.clone(), &ctx).await;
    if let Err(e @ Error::ChildLookup { .. }) = &result {
        ctx.events
            .publish(
                &object_ref,
                EventType::Warning,
                reasons::STATUS_CORRUPTED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
    }
    let mut status = result?;

    status.observed_generation = app.metadata.generation;
    if status != current {
        ctx.kube
            .patch_status(&namespace, &name, &current, &status)
            .await?;
    }

    Ok(Action::requeue(autoscaler::until_next_sample(
        status.last_sampled_at,
        Utc::now(),
        ctx.config.sample_interval,
    )))
}

async fn converge(
    app: &CeleryApp,
    namespace: &str,
    object_ref: &ObjectReference,
    mut status: CeleryAppStatus,
    ctx: &Context,
) -> Result<CeleryAppStatus, Error> {
    let spec = &app.spec;

    match status.applied_spec.clone() {
        None if status.children.is_empty() => {
            let owner = app
                .controller_owner_ref(&())
                .ok_or_else(|| Error::validation("celery app has no uid"))?;
            let revision = status.next_revision();
            status.children =
                create_children(ctx.kube.as_ref(), spec, namespace, &owner, revision).await?;
            status.revision = revision;
            status.applied_spec = Some(spec.clone());
            status = status
                .phase(AppPhase::Created)
                .message("worker, flower and service created")
                .condition(Condition::new(
                    "Ready",
                    ConditionStatus::True,
                    "ChildrenCreated",
                    "all children created",
                ));
            ctx.events
                .publish(
                    object_ref,
                    EventType::Normal,
                    reasons::CHILDREN_CREATED,
                    actions::RECONCILE,
                    None,
                )
                .await;
        }
        Some(applied) if applied == *spec => debug!("spec unchanged"),
        applied => {
            let old = serde_json::to_value(&applied)
                .map_err(|e| Error::serialization(e.to_string()))?;
            let new =
                serde_json::to_value(spec).map_err(|e| Error::serialization(e.to_string()))?;
            let plan = ChangeSet::between(&old, &new).plan();
            debug!(?plan, "classified spec change");

            let revision = status.next_revision();
            if let Some(children) = update_children(
                ctx.kube.as_ref(),
                spec,
                namespace,
                &status.children,
                plan,
                revision,
            )
            .await?
            {
                status.children = children;
                status.revision = revision;
                status = status
                    .phase(AppPhase::Updated)
                    .message(refresh_message(plan))
                    .condition(Condition::new(
                        "Ready",
                        ConditionStatus::True,
                        "ChildrenUpdated",
                        refresh_message(plan),
                    ));
                ctx.events
                    .publish(
                        object_ref,
                        EventType::Normal,
                        reasons::CHILDREN_UPDATED,
                        actions::RECONCILE,
                        Some(refresh_message(plan).to_string()),
                    )
                    .await;
            } else if status.phase == AppPhase::Failed {
                status = status
                    .phase(AppPhase::Updated)
                    .message("spec is valid again")
                    .condition(Condition::new(
                        "Ready",
                        ConditionStatus::True,
                        "SpecValid",
                        "spec is valid again",
                    ));
            }
            status.applied_spec = Some(spec.clone());
        }
    }

    if status.has_unhandled_sample() {
        status = scale(app, namespace, object_ref, status, ctx).await?;
    }

    let now = Utc::now();
    if autoscaler::sampling_due(status.last_sampled_at, now, ctx.config.sample_interval) {
        let endpoint = ChildRegistry::new(&status.children).flower_endpoint(namespace)?;
        status.queue_length = Some(autoscaler::sample(ctx.flower.as_ref(), &endpoint).await);
        status.last_sampled_at = Some(now);
    }

    Ok(status)
}

async fn scale(
    app: &CeleryApp,
    namespace: &str,
    object_ref: &ObjectReference,
    mut status: CeleryAppStatus,
    ctx: &Context,
) -> Result<CeleryAppStatus, Error> {
    let sample = status.queue_length.clone().unwrap_or_default();
    let plan = autoscaler::plan_scale(&app.spec, &status.children, &sample)?;

    for (index, e) in &plan.rejected {
        ctx.events
            .publish(
                object_ref,
                EventType::Warning,
                reasons::INVALID_SCALE_TARGET,
                actions::SCALE,
                Some(format!("scaleTargets[{index}]: {e}")),
            )
            .await;
    }

    if let Some(decision) = &plan.decision {
        let revision = status.next_revision();
        status.children = apply_scale(
            ctx.kube.as_ref(),
            namespace,
            &status.children,
            decision,
            revision,
        )
        .await?;
        status.revision = revision;
        ctx.events
            .publish(
                object_ref,
                EventType::Normal,
                reasons::SCALED,
                actions::SCALE,
                Some(format!(
                    "scaled {} to {} replicas",
                    decision.deployment_name, decision.replicas
                )),
            )
            .await;
    }

    status.last_scale = Some(ScaleRecord {
        sample,
        deployment_name: plan.decision.as_ref().map(|d| d.deployment_name.clone()),
        replicas: plan.decision.as_ref().map(|d| d.replicas),
        decided_at: Utc::now(),
    });
    Ok(status)
}

fn refresh_message(plan: RefreshPlan) -> &'static str {
    match plan {
        RefreshPlan::All => "all children refreshed",
        RefreshPlan::Only {
            worker: true,
            flower: true,
        } => "worker and flower refreshed",
        RefreshPlan::Only { worker: true, .. } => "worker refreshed",
        RefreshPlan::Only { .. } => "flower refreshed",
        RefreshPlan::Nothing => "no children affected",
    }
}

/// Error policy for the controller
///
/// Transient failures are retried after the configured backoff; everything
/// else waits for the object to change.
pub fn error_policy(app: Arc<CeleryApp>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        app = %app.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.config.error_backoff)
    } else {
        Action::await_change()
    }
}
