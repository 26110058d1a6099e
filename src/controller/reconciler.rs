//! Child create/update orchestration
//!
//! Builds desired state with [`ChildCompiler`] and hands it to the
//! [`KubeClient`]. Returned ChildRefs always carry what the API server
//! answered, never what was requested.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::{debug, info};

use super::KubeClient;
use crate::autoscaler::ScaleDecision;
use crate::changes::RefreshPlan;
use crate::crd::{CeleryAppSpec, ChildRef, ChildType, WriteOrigin};
use crate::registry::ChildRegistry;
use crate::workload::{ChildCompiler, DeploymentPatch};
use crate::Error;

/// Create the worker Deployment, flower Deployment and flower Service
///
/// Returns exactly one record per (kind, type), stamped as create-time
/// writes at `revision`.
pub async fn create_children(
    kube: &dyn KubeClient,
    spec: &CeleryAppSpec,
    namespace: &str,
    owner: &OwnerReference,
    revision: u64,
) -> Result<Vec<ChildRef>, Error> {
    let compiled = ChildCompiler::new(spec).compile(namespace, owner);

    let worker = kube.create_deployment(namespace, &compiled.worker).await?;
    info!(name = %worker.name, "worker deployment created");
    let flower = kube.create_deployment(namespace, &compiled.flower).await?;
    info!(name = %flower.name, "flower deployment created");
    let service = kube.create_service(namespace, &compiled.service).await?;
    info!(name = %service.name, "flower service created");

    Ok(vec![
        worker
            .child_ref(ChildType::Worker)
            .written(WriteOrigin::Create, revision),
        flower
            .child_ref(ChildType::Flower)
            .written(WriteOrigin::Create, revision),
        service.child_ref().written(WriteOrigin::Create, revision),
    ])
}

/// Refresh children after a spec change
///
/// Targets are resolved by name from `children`, so renames of `appName`
/// never recreate objects. Returns `None` when the plan writes nothing.
pub async fn update_children(
    kube: &dyn KubeClient,
    spec: &CeleryAppSpec,
    namespace: &str,
    children: &[ChildRef],
    plan: RefreshPlan,
    revision: u64,
) -> Result<Option<Vec<ChildRef>>, Error> {
    let compiler = ChildCompiler::new(spec);
    let registry = ChildRegistry::new(children);

    match plan {
        RefreshPlan::Nothing => {
            debug!("no child-affecting changes");
            Ok(None)
        }
        RefreshPlan::All => {
            let worker_name = &registry.worker_deployment()?.name;
            let flower_name = &registry.flower_deployment()?.name;
            let service_name = &registry.flower_service()?.name;

            let worker = kube
                .patch_deployment(namespace, worker_name, &compiler.worker_patch())
                .await?;
            let flower = kube
                .patch_deployment(namespace, flower_name, &compiler.flower_patch())
                .await?;
            let service = kube.get_service(namespace, service_name).await?;
            info!("all children refreshed");

            Ok(Some(vec![
                worker
                    .child_ref(ChildType::Worker)
                    .written(WriteOrigin::Update, revision),
                flower
                    .child_ref(ChildType::Flower)
                    .written(WriteOrigin::Update, revision),
                service.child_ref().written(WriteOrigin::Update, revision),
            ]))
        }
        RefreshPlan::Only { worker, flower } => {
            let mut updated = children.to_vec();
            if worker {
                let name = &registry.worker_deployment()?.name;
                let state = kube
                    .patch_deployment(namespace, name, &compiler.worker_patch())
                    .await?;
                info!(name = %state.name, "worker deployment refreshed");
                ChildRegistry::merge(
                    &mut updated,
                    state
                        .child_ref(ChildType::Worker)
                        .written(WriteOrigin::Update, revision),
                );
            }
            if flower {
                let name = &registry.flower_deployment()?.name;
                let state = kube
                    .patch_deployment(namespace, name, &compiler.flower_patch())
                    .await?;
                info!(name = %state.name, "flower deployment refreshed");
                ChildRegistry::merge(
                    &mut updated,
                    state
                        .child_ref(ChildType::Flower)
                        .written(WriteOrigin::Update, revision),
                );
            }
            Ok(Some(updated))
        }
    }
}

/// Apply an autoscaling decision with a replicas-only patch
///
/// Returns the children list with the worker record replaced in place.
pub async fn apply_scale(
    kube: &dyn KubeClient,
    namespace: &str,
    children: &[ChildRef],
    decision: &ScaleDecision,
    revision: u64,
) -> Result<Vec<ChildRef>, Error> {
    let state = kube
        .patch_deployment(
            namespace,
            &decision.deployment_name,
            &DeploymentPatch::scale(decision.replicas),
        )
        .await?;
    info!(name = %state.name, replicas = decision.replicas, "worker deployment scaled");

    let mut updated = children.to_vec();
    ChildRegistry::merge(
        &mut updated,
        state
            .child_ref(ChildType::Worker)
            .written(WriteOrigin::Update, revision),
    );
    Ok(updated)
}
