//! CeleryApp Custom Resource Definition
//!
//! A CeleryApp declares a Celery application: the worker pool, the flower
//! monitoring UI that fronts it, and optional queue-length autoscaling.
//! The operator turns one CeleryApp into two Deployments and a Service.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    AppPhase, ChildRef, Condition, FlowerSpec, LocalObjectReference, QueueLength, ScaleRecord,
    ScaleTarget, WorkerSpec,
};
use crate::changes::merge_patch;
use crate::Error;

/// Longest accepted `appName`; leaves room for the `-celery-worker` suffix
/// within the 63 character object name limit
pub const MAX_APP_NAME_LEN: usize = 40;

/// Service type used for flower when none is configured
pub const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";

/// Specification for a CeleryApp
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "celeryproject.org",
    version = "v1alpha1",
    kind = "CeleryApp",
    plural = "celeryapps",
    shortname = "capp",
    status = "CeleryAppStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"App","type":"string","jsonPath":".spec.celeryApp"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CeleryAppSpec {
    /// Name prefix for every managed child
    #[serde(default)]
    pub app_name: String,

    /// Celery application module passed to `--app`
    #[serde(default)]
    pub celery_app: String,

    /// Container image running both worker and flower
    #[serde(default)]
    pub image: String,

    /// Image pull policy for both containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Pull secrets for both pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    /// Worker pool configuration
    #[serde(default)]
    pub worker_spec: WorkerSpec,

    /// Flower configuration
    #[serde(default)]
    pub flower_spec: FlowerSpec,

    /// Queue-length autoscaling targets, evaluated in order
    #[serde(
        default,
        alias = "scaleTargetRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub scale_targets: Option<Vec<ScaleTarget>>,
}

impl CeleryAppSpec {
    /// Parse and validate a raw spec document
    ///
    /// Fails with the first missing required field; type mismatches are
    /// reported as validation errors too.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, Error> {
        if !value.is_object() {
            return Err(Error::validation("spec must be a mapping"));
        }
        let spec: Self = serde_json::from_value(value.clone())
            .map_err(|e| Error::validation(format!("malformed spec: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<(), Error> {
        let required = [
            ("appName", !self.app_name.is_empty()),
            ("celeryApp", !self.celery_app.is_empty()),
            ("image", !self.image.is_empty()),
            ("workerSpec.resources", self.worker_spec.resources.is_some()),
            ("flowerSpec.resources", self.flower_spec.resources.is_some()),
        ];
        if let Some((field, _)) = required.iter().find(|(_, present)| !present) {
            return Err(Error::validation(format!(
                "missing required field '{field}'"
            )));
        }

        validate_app_name(&self.app_name)
    }

    /// Name of the worker Deployment
    pub fn worker_name(&self) -> String {
        format!("{}-celery-worker", self.app_name)
    }

    /// Name shared by the flower Deployment and Service
    pub fn flower_name(&self) -> String {
        format!("{}-celery-flower", self.app_name)
    }

    /// Service type for flower
    pub fn service_type(&self) -> &str {
        self.flower_spec
            .service
            .as_ref()
            .and_then(|s| s.type_.as_deref())
            .unwrap_or(DEFAULT_SERVICE_TYPE)
    }

    /// Configured scale targets, empty when none are set
    pub fn scale_targets(&self) -> &[ScaleTarget] {
        self.scale_targets.as_deref().unwrap_or_default()
    }
}

fn validate_app_name(name: &str) -> Result<(), Error> {
    if name.len() > MAX_APP_NAME_LEN {
        return Err(Error::validation(format!(
            "appName '{name}' is longer than {MAX_APP_NAME_LEN} characters"
        )));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(Error::validation(format!(
            "appName '{name}' must consist of lowercase alphanumerics or '-', and start and end with an alphanumeric"
        )));
    }
    Ok(())
}

/// Status for a CeleryApp
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CeleryAppStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: AppPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the app state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Managed children, one entry per (kind, type)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildRef>,

    /// Last queue sample taken from flower
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<Vec<QueueLength>>,

    /// Bumped on every successful child write
    #[serde(default)]
    pub revision: u64,

    /// Generation of the spec last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Spec last applied to the children
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<CeleryAppSpec>,

    /// When flower was last sampled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sampled_at: Option<DateTime<Utc>>,

    /// Last autoscaling decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale: Option<ScaleRecord>,
}

impl CeleryAppStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: AppPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: AppPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Revision the next child write will be recorded at
    pub fn next_revision(&self) -> u64 {
        self.revision + 1
    }

    /// Returns true if the latest queue sample has not been acted on yet
    pub fn has_unhandled_sample(&self) -> bool {
        match (&self.queue_length, &self.last_scale) {
            (None, _) => false,
            (Some(sample), None) => !sample.is_empty(),
            (Some(sample), Some(last)) => *sample != last.sample,
        }
    }

    /// Merge patch body that turns the stored `previous` status into this one
    ///
    /// Cleared fields are sent as explicit nulls; a plain merge of the
    /// serialized status would leave them behind on the server.
    pub fn merge_patch_from(
        &self,
        previous: &CeleryAppStatus,
    ) -> Result<serde_json::Value, Error> {
        let old =
            serde_json::to_value(previous).map_err(|e| Error::serialization(e.to_string()))?;
        let new = serde_json::to_value(self).map_err(|e| Error::serialization(e.to_string()))?;
        Ok(serde_json::json!({ "status": merge_patch(&old, &new) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{ConditionStatus, ResourceQuantity, ResourceRequirements};
    use chrono::Utc;
    use kube::CustomResourceExt;
    use rstest::rstest;
    use serde_json::json;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_spec_value() -> serde_json::Value {
        json!({
            "appName": "shop",
            "celeryApp": "shop.tasks",
            "image": "registry.local/shop:1.4",
            "imagePullPolicy": "IfNotPresent",
            "workerSpec": {
                "numOfWorkers": 2,
                "queues": "celery",
                "logLevel": "info",
                "concurrency": 4,
                "resources": {
                    "requests": {"cpu": "100m", "memory": "128Mi"},
                    "limits": {"cpu": "500m", "memory": "256Mi"}
                }
            },
            "flowerSpec": {
                "replicas": 1,
                "resources": {"limits": {"cpu": "100m", "memory": "64Mi"}}
            },
            "scaleTargets": [{
                "kind": "worker",
                "minReplicas": 2,
                "maxReplicas": 10,
                "metrics": [{"target": {"averageValue": 100}}]
            }]
        })
    }

    fn resources() -> ResourceRequirements {
        ResourceRequirements {
            requests: None,
            limits: Some(ResourceQuantity {
                cpu: Some("100m".to_string()),
                memory: None,
            }),
        }
    }

    // =========================================================================
    // Normalization Stories
    // =========================================================================

    /// Story: A well-formed spec survives normalization unchanged
    ///
    /// Defaults are applied where they are used, so the typed spec writes back
    /// exactly the document the user submitted.
    #[test]
    fn story_normalized_spec_reserializes_to_input() {
        let raw = sample_spec_value();
        let spec = CeleryAppSpec::from_value(&raw).expect("valid spec");
        assert_eq!(serde_json::to_value(&spec).unwrap(), raw);
    }

    /// Story: Omitted optional scalars pick up their documented defaults
    #[test]
    fn story_omitted_scalars_use_defaults() {
        let raw = json!({
            "appName": "shop",
            "celeryApp": "shop.tasks",
            "image": "shop:1",
            "workerSpec": {"resources": {}},
            "flowerSpec": {"resources": {}}
        });
        let spec = CeleryAppSpec::from_value(&raw).expect("valid spec");

        assert_eq!(spec.worker_spec.replicas(), 1);
        assert_eq!(spec.worker_spec.queues(), "celery");
        assert_eq!(spec.flower_spec.replicas(), 1);
        assert_eq!(spec.service_type(), "ClusterIP");
        assert!(spec.scale_targets().is_empty());
        assert_eq!(serde_json::to_value(&spec).unwrap(), raw);
    }

    /// Story: Manifests written against the older field name still scale
    #[test]
    fn story_legacy_scale_target_key_is_accepted() {
        let mut raw = sample_spec_value();
        let targets = raw["scaleTargets"].take();
        raw.as_object_mut().unwrap().remove("scaleTargets");
        raw["scaleTargetRef"] = targets;

        let spec = CeleryAppSpec::from_value(&raw).expect("valid spec");
        assert_eq!(spec.scale_targets().len(), 1);
        assert_eq!(spec.scale_targets()[0].max_replicas, Some(10));
    }

    // =========================================================================
    // Validation Stories
    // =========================================================================

    /// Story: Only the first missing required field is reported, in a fixed order
    #[rstest]
    #[case::all_missing(&[], "appName")]
    #[case::app_name_present(&["appName"], "celeryApp")]
    #[case::image_missing(&["appName", "celeryApp"], "'image'")]
    #[case::worker_resources(&["appName", "celeryApp", "image"], "workerSpec.resources")]
    #[case::flower_resources(
        &["appName", "celeryApp", "image", "workerSpec"],
        "flowerSpec.resources"
    )]
    fn story_first_missing_field_is_reported(#[case] keep: &[&str], #[case] expected: &str) {
        let full = sample_spec_value();
        let mut raw = json!({});
        for key in keep {
            raw[*key] = full[*key].clone();
        }

        let err = CeleryAppSpec::from_value(&raw).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(
            err.to_string().contains(expected),
            "expected '{expected}' in '{err}'"
        );
    }

    /// Story: An empty string is as good as a missing field
    #[test]
    fn story_empty_strings_count_as_missing() {
        let mut raw = sample_spec_value();
        raw["celeryApp"] = json!("");
        let err = CeleryAppSpec::from_value(&raw).unwrap_err();
        assert!(err.to_string().contains("celeryApp"));
    }

    /// Story: Child names derive from appName, so it must be a valid label
    #[rstest]
    #[case::uppercase("Shop")]
    #[case::underscore("shop_app")]
    #[case::leading_dash("-shop")]
    #[case::trailing_dash("shop-")]
    #[case::too_long("a-very-long-application-name-for-a-celery-app")]
    fn story_invalid_app_names_are_rejected(#[case] name: &str) {
        let mut raw = sample_spec_value();
        raw["appName"] = json!(name);
        let err = CeleryAppSpec::from_value(&raw).unwrap_err();
        assert!(err.to_string().contains("appName"));
    }

    #[test]
    fn test_wrong_types_are_validation_errors() {
        let mut raw = sample_spec_value();
        raw["workerSpec"]["numOfWorkers"] = json!("two");
        let err = CeleryAppSpec::from_value(&raw).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("malformed spec"));
    }

    #[test]
    fn test_non_mapping_is_rejected() {
        let err = CeleryAppSpec::from_value(&json!(["appName"])).unwrap_err();
        assert!(err.to_string().contains("mapping"));
    }

    #[test]
    fn test_typed_spec_validates_without_parsing() {
        let spec = CeleryAppSpec {
            app_name: "shop".to_string(),
            celery_app: "shop.tasks".to_string(),
            image: "shop:1".to_string(),
            worker_spec: WorkerSpec {
                resources: Some(resources()),
                ..Default::default()
            },
            flower_spec: FlowerSpec {
                resources: Some(resources()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_child_names_share_app_prefix() {
        let spec = CeleryAppSpec::from_value(&sample_spec_value()).unwrap();
        assert_eq!(spec.worker_name(), "shop-celery-worker");
        assert_eq!(spec.flower_name(), "shop-celery-flower");
    }

    // =========================================================================
    // Status Stories
    // =========================================================================

    #[test]
    fn test_status_builders_replace_conditions_by_type() {
        let status = CeleryAppStatus::with_phase(AppPhase::Pending)
            .condition(Condition::new(
                "Ready",
                ConditionStatus::False,
                "Pending",
                "creating children",
            ))
            .condition(Condition::new(
                "Ready",
                ConditionStatus::True,
                "ChildrenCreated",
                "all children created",
            ))
            .phase(AppPhase::Created)
            .message("all children created");

        assert_eq!(status.phase, AppPhase::Created);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
        assert_eq!(status.message.as_deref(), Some("all children created"));
        assert_eq!(status.next_revision(), 1);
    }

    /// Story: A fresh queue sample is handled exactly once
    #[test]
    fn story_queue_sample_is_acted_on_once() {
        let sample = vec![QueueLength {
            name: "celery".to_string(),
            messages: 250,
        }];

        let mut status = CeleryAppStatus::default();
        assert!(!status.has_unhandled_sample(), "no sample yet");

        status.queue_length = Some(Vec::new());
        assert!(!status.has_unhandled_sample(), "empty sample is no signal");

        status.queue_length = Some(sample.clone());
        assert!(status.has_unhandled_sample());

        status.last_scale = Some(ScaleRecord {
            sample,
            deployment_name: Some("shop-celery-worker".to_string()),
            replicas: Some(3),
            decided_at: Utc::now(),
        });
        assert!(!status.has_unhandled_sample());
    }

    /// Story: Cleared status fields are removed from the stored copy
    ///
    /// The user drops `workerSpec.args` and the latest sample produced no
    /// scale decision. Both must disappear server-side, otherwise the next
    /// reconcile sees a stale applied spec and refreshes the worker again.
    #[test]
    fn story_status_patch_clears_removed_fields() {
        let mut old_spec: CeleryAppSpec = serde_json::from_value(sample_spec_value()).unwrap();
        old_spec.worker_spec.args = Some(vec!["-O".to_string(), "fair".to_string()]);
        let previous = CeleryAppStatus {
            applied_spec: Some(old_spec),
            last_scale: Some(ScaleRecord {
                sample: Vec::new(),
                deployment_name: Some("shop-celery-worker".to_string()),
                replicas: Some(7),
                decided_at: Utc::now(),
            }),
            ..CeleryAppStatus::with_phase(AppPhase::Updated)
        };

        let mut next = previous.clone();
        next.applied_spec = Some(serde_json::from_value(sample_spec_value()).unwrap());
        if let Some(last) = next.last_scale.as_mut() {
            last.deployment_name = None;
            last.replicas = None;
        }

        let patch = next.merge_patch_from(&previous).unwrap();
        let status_patch = &patch["status"];
        assert_eq!(
            status_patch["appliedSpec"]["workerSpec"].get("args"),
            Some(&json!(null))
        );
        assert_eq!(
            status_patch["lastScale"].get("deploymentName"),
            Some(&json!(null))
        );

        let mut stored = json!({ "status": previous });
        crate::changes::apply_merge_patch(&mut stored, &patch);
        let stored: CeleryAppStatus = serde_json::from_value(stored["status"].clone()).unwrap();
        assert_eq!(stored, next);
    }

    #[test]
    fn test_crd_metadata() {
        let crd = CeleryApp::crd();
        assert_eq!(crd.spec.group, "celeryproject.org");
        assert_eq!(crd.spec.names.kind, "CeleryApp");
        assert_eq!(crd.spec.names.plural, "celeryapps");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(
            crd.spec.names.short_names,
            Some(vec!["capp".to_string()])
        );
    }
}
