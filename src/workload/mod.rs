//! Workload types for Celery applications
//!
//! This module defines the Kubernetes objects a CeleryApp owns and the
//! compiler that builds them:
//! - Deployment: Celery workers and flower
//! - Service: Network exposure for flower
//! - DeploymentPatch: Merge patches restricted to replicas and the first container
//!
//! Bodies are plain typed structs; the controller converts them to API
//! objects at the client boundary.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

use crate::crd::{
    CeleryAppSpec, ChildRef, ChildType, EnvVar, LocalObjectReference, ResourceRequirements,
    ServiceSnapshot, FLOWER_PORT,
};

/// Label used to select pods of a child
pub const SELECTOR_LABEL: &str = "app";
/// Command run by both containers
pub const CELERY_COMMAND: &str = "celery";

const MANAGED_BY: &str = "celery-operator";

// =============================================================================
// Kubernetes Resource Types
// =============================================================================

/// Standard Kubernetes ObjectMeta
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Owner references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Create new metadata with standard labels
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let name = name.into();
        let mut labels = BTreeMap::new();
        labels.insert(SELECTOR_LABEL.to_string(), name.clone());
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        );
        Self {
            name,
            namespace: namespace.into(),
            labels,
            owner_references: Vec::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the controller owner
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner_references = vec![owner];
        self
    }
}

// =============================================================================
// Deployment
// =============================================================================

/// Kubernetes Deployment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: DeploymentSpec,
}

/// Deployment spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Number of replicas
    pub replicas: u32,
    /// Label selector
    pub selector: LabelSelector,
    /// Pod template
    pub template: PodTemplateSpec,
}

/// Label selector
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Match labels
    pub match_labels: BTreeMap<String, String>,
}

/// Pod template spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    /// Pod metadata
    pub metadata: PodMeta,
    /// Pod spec
    pub spec: PodSpec,
}

/// Pod metadata (subset of ObjectMeta)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// Pod spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Containers
    pub containers: Vec<Container>,
    /// Image pull secrets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Container spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container name
    pub name: String,
    /// Image
    pub image: String,
    /// Image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Command
    pub command: Vec<String>,
    /// Args
    pub args: Vec<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    /// Resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Container port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    /// Port name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port number
    pub container_port: u16,
}

// =============================================================================
// Service
// =============================================================================

/// Kubernetes Service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: ServiceSpec,
}

/// Service spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Selector
    pub selector: BTreeMap<String, String>,
    /// Ports
    pub ports: Vec<ServicePort>,
    /// Service type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// Service port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    /// Port name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port number
    pub port: u16,
    /// Target port
    pub target_port: u16,
    /// Protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

// =============================================================================
// Patches
// =============================================================================

/// Merge patch for a managed Deployment
///
/// Only `spec.replicas` and `spec.template.spec.containers` are ever sent.
/// Selectors and metadata are fixed at creation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPatch {
    /// Patched spec
    pub spec: DeploymentSpecPatch,
}

/// Deployment spec fields touched by a patch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpecPatch {
    /// New replica count
    pub replicas: u32,
    /// New pod template, absent for scale-only patches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplatePatch>,
}

/// Pod template fields touched by a patch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePatch {
    /// Patched pod spec
    pub spec: PodSpecPatch,
}

/// Pod spec fields touched by a patch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpecPatch {
    /// Replacement container list (the single managed container)
    pub containers: Vec<Container>,
}

impl DeploymentPatch {
    /// Patch replicas and the managed container
    pub fn refresh(replicas: u32, container: Container) -> Self {
        Self {
            spec: DeploymentSpecPatch {
                replicas,
                template: Some(TemplatePatch {
                    spec: PodSpecPatch {
                        containers: vec![container],
                    },
                }),
            },
        }
    }

    /// Patch only the replica count
    pub fn scale(replicas: u32) -> Self {
        Self {
            spec: DeploymentSpecPatch {
                replicas,
                template: None,
            },
        }
    }
}

// =============================================================================
// Observed State
// =============================================================================

/// A Deployment as returned by the API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentState {
    /// Live object name
    pub name: String,
    /// Replica count in the returned spec
    pub replicas: Option<u32>,
}

impl DeploymentState {
    /// Status record for this Deployment
    pub fn child_ref(&self, type_: ChildType) -> ChildRef {
        ChildRef::deployment(self.name.clone(), type_, self.replicas)
    }
}

/// A Service as returned by the API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceState {
    /// Live object name
    pub name: String,
    /// Returned spec
    pub spec: ServiceSnapshot,
}

impl ServiceState {
    /// Status record for this Service
    pub fn child_ref(&self) -> ChildRef {
        ChildRef::service(self.name.clone(), self.spec.clone())
    }
}

// =============================================================================
// Child Compiler
// =============================================================================

/// The three children of a CeleryApp
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledChildren {
    /// Worker Deployment
    pub worker: Deployment,
    /// Flower Deployment
    pub flower: Deployment,
    /// Flower Service
    pub service: Service,
}

/// Compiler for the Kubernetes objects owned by a CeleryApp
///
/// Construction is pure and infallible for a validated spec.
pub struct ChildCompiler<'a> {
    spec: &'a CeleryAppSpec,
}

impl<'a> ChildCompiler<'a> {
    /// Create a compiler for the given spec
    pub fn new(spec: &'a CeleryAppSpec) -> Self {
        Self { spec }
    }

    /// Compile every child, owned by `owner`
    pub fn compile(&self, namespace: &str, owner: &OwnerReference) -> CompiledChildren {
        CompiledChildren {
            worker: self.deployment(
                self.spec.worker_name(),
                namespace,
                owner,
                self.spec.worker_spec.replicas(),
                self.worker_container(),
                self.spec.worker_spec.node_selector.clone(),
            ),
            flower: self.deployment(
                self.spec.flower_name(),
                namespace,
                owner,
                self.spec.flower_spec.replicas(),
                self.flower_container(),
                self.spec.flower_spec.node_selector.clone(),
            ),
            service: self.service(namespace, owner),
        }
    }

    /// Patch refreshing the worker Deployment from the spec
    pub fn worker_patch(&self) -> DeploymentPatch {
        DeploymentPatch::refresh(self.spec.worker_spec.replicas(), self.worker_container())
    }

    /// Patch refreshing the flower Deployment from the spec
    pub fn flower_patch(&self) -> DeploymentPatch {
        DeploymentPatch::refresh(self.spec.flower_spec.replicas(), self.flower_container())
    }

    /// Arguments for the worker container
    ///
    /// The leading five arguments are a fixed contract with the Celery CLI;
    /// user arguments follow.
    pub fn worker_args(&self) -> Vec<String> {
        let worker = &self.spec.worker_spec;
        let mut args = vec![
            format!("--app={}", self.spec.celery_app),
            "worker".to_string(),
            format!("--queues={}", worker.queues()),
            format!("--loglevel={}", worker.log_level()),
            format!("--concurrency={}", worker.concurrency()),
        ];
        args.extend(worker.args.iter().flatten().cloned());
        args
    }

    /// Arguments for the flower container
    pub fn flower_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--app={}", self.spec.celery_app),
            "flower".to_string(),
        ];
        args.extend(self.spec.flower_spec.args.iter().flatten().cloned());
        args
    }

    /// The worker container
    pub fn worker_container(&self) -> Container {
        let worker = &self.spec.worker_spec;
        Container {
            name: self.spec.worker_name(),
            image: self.spec.image.clone(),
            image_pull_policy: self.spec.image_pull_policy.clone(),
            command: vec![CELERY_COMMAND.to_string()],
            args: self.worker_args(),
            env: worker.env.clone().unwrap_or_default(),
            ports: Vec::new(),
            resources: worker.resources.clone(),
        }
    }

    /// The flower container
    pub fn flower_container(&self) -> Container {
        let flower = &self.spec.flower_spec;
        Container {
            name: self.spec.flower_name(),
            image: self.spec.image.clone(),
            image_pull_policy: self.spec.image_pull_policy.clone(),
            command: vec![CELERY_COMMAND.to_string()],
            args: self.flower_args(),
            env: flower.env.clone().unwrap_or_default(),
            ports: vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: FLOWER_PORT,
            }],
            resources: flower.resources.clone(),
        }
    }

    fn deployment(
        &self,
        name: String,
        namespace: &str,
        owner: &OwnerReference,
        replicas: u32,
        container: Container,
        node_selector: Option<BTreeMap<String, String>>,
    ) -> Deployment {
        let selector = selector_labels(&name);
        let metadata = ObjectMeta::new(name, namespace)
            .with_label("app.kubernetes.io/part-of", self.spec.app_name.clone())
            .with_owner(owner.clone());

        Deployment {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            metadata,
            spec: DeploymentSpec {
                replicas,
                selector: LabelSelector {
                    match_labels: selector.clone(),
                },
                template: PodTemplateSpec {
                    metadata: PodMeta { labels: selector },
                    spec: PodSpec {
                        containers: vec![container],
                        image_pull_secrets: self
                            .spec
                            .image_pull_secrets
                            .clone()
                            .unwrap_or_default(),
                        node_selector: node_selector.unwrap_or_default(),
                    },
                },
            },
        }
    }

    fn service(&self, namespace: &str, owner: &OwnerReference) -> Service {
        let name = self.spec.flower_name();
        let selector = selector_labels(&name);
        let metadata = ObjectMeta::new(name, namespace)
            .with_label("app.kubernetes.io/part-of", self.spec.app_name.clone())
            .with_owner(owner.clone());

        Service {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata,
            spec: ServiceSpec {
                selector,
                ports: vec![ServicePort {
                    name: Some("http".to_string()),
                    port: self.spec.flower_spec.service_port(),
                    target_port: FLOWER_PORT,
                    protocol: Some("TCP".to_string()),
                }],
                type_: Some(self.spec.service_type().to_string()),
            },
        }
    }
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(SELECTOR_LABEL.to_string(), name.to_string())])
}
