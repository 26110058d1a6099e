//! Spec change classification
//!
//! Decides which children an update must touch by diffing the last applied
//! spec against the current one. Fields shared by every child (`appName`,
//! `celeryApp`, `image`) force a full refresh; changes under `workerSpec` or
//! `flowerSpec` only refresh the matching Deployment.

use std::fmt;

use serde_json::Value;

/// Fields whose change affects every child
pub const COMMON_FIELDS: [&str; 3] = ["appName", "celeryApp", "image"];

const WORKER_FIELD: &str = "workerSpec";
const FLOWER_FIELD: &str = "flowerSpec";
const SPEC_ROOT: &str = "spec";

/// Location of a changed field as a list of object keys
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Path from segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Path with the given segment appended
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    /// Segments, without a leading `spec`
    pub fn segments(&self) -> &[String] {
        match self.0.split_first() {
            Some((first, rest)) if first == SPEC_ROOT => rest,
            _ => &self.0,
        }
    }

    /// Returns true if any segment equals `name`
    pub fn contains(&self, name: &str) -> bool {
        self.segments().iter().any(|s| s == name)
    }

    /// Returns true if the path names no field
    pub fn is_root(&self) -> bool {
        self.segments().is_empty()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// One entry of a structural spec diff
#[derive(Clone, Debug, PartialEq)]
pub enum SpecChange {
    /// A field appeared
    Added {
        /// Location of the field
        path: FieldPath,
        /// New value
        new: Value,
    },
    /// A field disappeared
    Removed {
        /// Location of the field
        path: FieldPath,
        /// Previous value
        old: Value,
    },
    /// A field changed value
    Changed {
        /// Location of the field
        path: FieldPath,
        /// Previous value
        old: Value,
        /// New value
        new: Value,
    },
}

impl SpecChange {
    /// Location of the change
    pub fn path(&self) -> &FieldPath {
        match self {
            Self::Added { path, .. } | Self::Removed { path, .. } | Self::Changed { path, .. } => {
                path
            }
        }
    }
}

/// Compute the structural diff between two spec documents
///
/// Objects are compared key by key; arrays and scalars are compared whole.
/// Entries come out in key order.
pub fn diff_specs(old: &Value, new: &Value) -> Vec<SpecChange> {
    let mut changes = Vec::new();
    diff_into(&FieldPath::default(), old, new, &mut changes);
    changes
}

fn diff_into(path: &FieldPath, old: &Value, new: &Value, out: &mut Vec<SpecChange>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = path.child(key);
                match (old_map.get(key), new_map.get(key)) {
                    (Some(o), Some(n)) => diff_into(&path, o, n, out),
                    (Some(o), None) => out.push(SpecChange::Removed {
                        path,
                        old: o.clone(),
                    }),
                    (None, Some(n)) => out.push(SpecChange::Added {
                        path,
                        new: n.clone(),
                    }),
                    (None, None) => {}
                }
            }
        }
        (o, n) if o != n => out.push(SpecChange::Changed {
            path: path.clone(),
            old: o.clone(),
            new: n.clone(),
        }),
        _ => {}
    }
}

/// JSON merge patch (RFC 7386) that turns `old` into `new`
///
/// Keys missing from `new` are sent as `null` so the server removes them.
/// Arrays and scalars are replaced whole; unchanged keys are left out.
pub fn merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = serde_json::Map::new();
            for (key, old_value) in old_map {
                match new_map.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) if new_value != old_value => {
                        patch.insert(key.clone(), merge_patch(old_value, new_value));
                    }
                    Some(_) => {}
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Apply a merge patch the way the API server does
#[cfg(test)]
pub(crate) fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in entries {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Which children a set of spec changes affects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// A field shared by every child changed
    pub common_changed: bool,
    /// Something under `workerSpec` changed
    pub worker_changed: bool,
    /// Something under `flowerSpec` changed
    pub flower_changed: bool,
}

impl ChangeSet {
    /// Classify diff entries
    pub fn classify(changes: &[SpecChange]) -> Self {
        changes.iter().fold(Self::default(), |mut set, change| {
            let path = change.path();
            set.common_changed |=
                path.is_root() || COMMON_FIELDS.iter().any(|f| path.contains(f));
            set.worker_changed |= path.contains(WORKER_FIELD);
            set.flower_changed |= path.contains(FLOWER_FIELD);
            set
        })
    }

    /// Diff two spec documents and classify the result
    pub fn between(old: &Value, new: &Value) -> Self {
        Self::classify(&diff_specs(old, new))
    }

    /// Which children to refresh; a common change refreshes everything
    pub fn plan(&self) -> RefreshPlan {
        if self.common_changed {
            RefreshPlan::All
        } else if self.worker_changed || self.flower_changed {
            RefreshPlan::Only {
                worker: self.worker_changed,
                flower: self.flower_changed,
            }
        } else {
            RefreshPlan::Nothing
        }
    }
}

/// Children an update must write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Rebuild every child
    All,
    /// Patch only the selected Deployments
    Only {
        /// Patch the worker Deployment
        worker: bool,
        /// Patch the flower Deployment
        flower: bool,
    },
    /// No child is affected
    Nothing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn base_spec() -> Value {
        json!({
            "appName": "shop",
            "celeryApp": "shop.tasks",
            "image": "shop:1",
            "workerSpec": {"queues": "celery", "resources": {"limits": {"cpu": "1"}}},
            "flowerSpec": {"replicas": 1, "resources": {}},
            "scaleTargets": [{"kind": "worker", "maxReplicas": 5}]
        })
    }

    // =========================================================================
    // Merge Patch Stories
    // =========================================================================

    /// Story: A field the user deleted is deleted from the stored copy too
    #[test]
    fn story_removed_field_is_nulled() {
        let old = json!({"workerSpec": {"queues": "celery", "args": ["-O", "fair"]}});
        let new = json!({"workerSpec": {"queues": "celery"}});

        let patch = merge_patch(&old, &new);
        assert_eq!(patch, json!({"workerSpec": {"args": null}}));

        let mut stored = old.clone();
        apply_merge_patch(&mut stored, &patch);
        assert_eq!(stored, new);
    }

    /// Story: Applying the patch always reproduces the new document
    #[rstest]
    #[case::added_key(json!({"a": 1}), json!({"a": 1, "b": {"c": 2}}))]
    #[case::nested_removal(json!({"a": {"b": 1, "c": 2}}), json!({"a": {"b": 1}}))]
    #[case::array_shrinks(json!({"a": [1, 2, 3]}), json!({"a": [1]}))]
    #[case::object_becomes_scalar(json!({"a": {"b": 1}}), json!({"a": 5}))]
    #[case::unchanged(base_spec(), base_spec())]
    fn story_patch_round_trips(#[case] old: Value, #[case] new: Value) {
        let mut stored = old.clone();
        apply_merge_patch(&mut stored, &merge_patch(&old, &new));
        assert_eq!(stored, new);
    }

    #[test]
    fn test_unchanged_document_yields_empty_patch() {
        assert_eq!(merge_patch(&base_spec(), &base_spec()), json!({}));
    }

    // =========================================================================
    // Diff Stories
    // =========================================================================

    /// Story: Nested edits are reported at the leaf that changed
    #[test]
    fn story_diff_reports_leaf_paths() {
        let old = base_spec();
        let mut new = base_spec();
        new["workerSpec"]["queues"] = json!("emails");

        let changes = diff_specs(&old, &new);
        assert_eq!(
            changes,
            vec![SpecChange::Changed {
                path: FieldPath::new(["workerSpec", "queues"]),
                old: json!("celery"),
                new: json!("emails"),
            }]
        );
    }

    #[test]
    fn test_diff_reports_added_and_removed_keys() {
        let old = json!({"workerSpec": {"queues": "celery"}});
        let new = json!({"workerSpec": {"logLevel": "debug"}});

        let changes = diff_specs(&old, &new);
        assert_eq!(changes.len(), 2);
        assert!(matches!(
            &changes[0],
            SpecChange::Added { path, new } if path.to_string() == "workerSpec.logLevel" && new == "debug"
        ));
        assert!(matches!(
            &changes[1],
            SpecChange::Removed { path, old } if path.to_string() == "workerSpec.queues" && old == "celery"
        ));
    }

    #[test]
    fn test_arrays_compare_whole() {
        let old = json!({"workerSpec": {"args": ["-O", "fair"]}});
        let new = json!({"workerSpec": {"args": ["-O", "fast"]}});

        let changes = diff_specs(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path(), &FieldPath::new(["workerSpec", "args"]));
    }

    #[test]
    fn test_identical_specs_have_no_diff() {
        assert!(diff_specs(&base_spec(), &base_spec()).is_empty());
        assert_eq!(
            ChangeSet::between(&base_spec(), &base_spec()).plan(),
            RefreshPlan::Nothing
        );
    }

    // =========================================================================
    // Classification Stories
    // =========================================================================

    /// Story: Each kind of edit refreshes exactly the children it affects
    #[rstest]
    #[case::queues(json!(["workerSpec", "queues"]), false, true, false)]
    #[case::flower_replicas(json!(["flowerSpec", "replicas"]), false, false, true)]
    #[case::image(json!(["image"]), true, false, false)]
    #[case::celery_app(json!(["celeryApp"]), true, false, false)]
    #[case::spec_prefixed(json!(["spec", "workerSpec", "concurrency"]), false, true, false)]
    #[case::spec_prefixed_common(json!(["spec", "appName"]), true, false, false)]
    #[case::scale_targets(json!(["scaleTargets"]), false, false, false)]
    #[case::whole_spec(json!([]), true, false, false)]
    fn story_paths_map_to_children(
        #[case] path: Value,
        #[case] common: bool,
        #[case] worker: bool,
        #[case] flower: bool,
    ) {
        let segments: Vec<String> = serde_json::from_value(path).unwrap();
        let changes = vec![SpecChange::Changed {
            path: FieldPath::new(segments),
            old: json!(1),
            new: json!(2),
        }];

        assert_eq!(
            ChangeSet::classify(&changes),
            ChangeSet {
                common_changed: common,
                worker_changed: worker,
                flower_changed: flower,
            }
        );
    }

    /// Story: Renaming the app refreshes everything, whatever else changed
    #[test]
    fn story_common_change_supersedes_subtree_flags() {
        let old = base_spec();
        let mut new = base_spec();
        new["appName"] = json!("store");
        new["workerSpec"]["queues"] = json!("emails");

        let set = ChangeSet::between(&old, &new);
        assert!(set.common_changed);
        assert!(set.worker_changed);
        assert_eq!(set.plan(), RefreshPlan::All);
    }

    /// Story: Editing both subtrees patches both Deployments but not the Service
    #[test]
    fn story_both_subtrees_refresh_both_deployments() {
        let old = base_spec();
        let mut new = base_spec();
        new["workerSpec"]["queues"] = json!("emails");
        new["flowerSpec"]["replicas"] = json!(2);

        assert_eq!(
            ChangeSet::between(&old, &new).plan(),
            RefreshPlan::Only {
                worker: true,
                flower: true
            }
        );
    }

    /// Story: Tuning autoscaling alone touches no child
    #[test]
    fn story_scale_target_edit_is_not_a_child_change() {
        let old = base_spec();
        let mut new = base_spec();
        new["scaleTargets"][0]["maxReplicas"] = json!(20);

        assert_eq!(ChangeSet::between(&old, &new).plan(), RefreshPlan::Nothing);
    }

    #[test]
    fn test_appearing_spec_is_common() {
        let changes = diff_specs(&Value::Null, &base_spec());
        assert!(ChangeSet::classify(&changes).common_changed);
    }
}
