//! Child identity resolution
//!
//! Status is the only place the operator remembers which objects it created.
//! The registry answers "what is the live worker Deployment called" from the
//! children list, preferring the most recent write when a record was
//! rewritten by a later reconciliation.

use crate::crd::{ChildKind, ChildRef, ChildType, FLOWER_PORT};
use crate::{Error, Result};

/// Read-only view over recorded children
#[derive(Clone, Copy, Debug)]
pub struct ChildRegistry<'a> {
    children: &'a [ChildRef],
}

impl<'a> ChildRegistry<'a> {
    /// Create a registry over a status children list
    pub fn new(children: &'a [ChildRef]) -> Self {
        Self { children }
    }

    /// Resolve the live record for a (kind, type) pair
    ///
    /// The highest revision wins; at equal revisions an update record beats
    /// a create record.
    pub fn resolve(&self, kind: ChildKind, type_: ChildType) -> Result<&'a ChildRef> {
        self.children
            .iter()
            .filter(|c| c.is(kind, type_))
            .max_by_key(|c| (c.revision, c.recorded_by))
            .ok_or_else(|| Error::child_lookup(kind, type_))
    }

    /// Record of the worker Deployment
    pub fn worker_deployment(&self) -> Result<&'a ChildRef> {
        self.resolve(ChildKind::Deployment, ChildType::Worker)
    }

    /// Record of the flower Deployment
    pub fn flower_deployment(&self) -> Result<&'a ChildRef> {
        self.resolve(ChildKind::Deployment, ChildType::Flower)
    }

    /// The flower Service record
    pub fn flower_service(&self) -> Result<&'a ChildRef> {
        self.resolve(ChildKind::Service, ChildType::Flower)
    }

    /// In-cluster `host:port` of the flower Service
    pub fn flower_endpoint(&self, namespace: &str) -> Result<String> {
        let service = self.flower_service()?;
        let port = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.first())
            .map(|p| p.port)
            .unwrap_or(FLOWER_PORT);
        Ok(format!("{}.{}:{}", service.name, namespace, port))
    }

    /// Replace the record for the entry's (kind, type) in place
    ///
    /// Duplicate records for the same pair collapse into the new entry at the
    /// position of the first one. Appends when no record exists.
    pub fn merge(children: &mut Vec<ChildRef>, entry: ChildRef) {
        let (kind, type_) = (entry.kind, entry.type_);
        match children.iter().position(|c| c.is(kind, type_)) {
            Some(idx) => {
                children[idx] = entry;
                let mut seen = 0usize;
                children.retain(|c| {
                    if c.is(kind, type_) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => children.push(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ServicePortSnapshot, ServiceSnapshot, WriteOrigin};

    fn worker(name: &str, replicas: u32, origin: WriteOrigin, revision: u64) -> ChildRef {
        ChildRef::deployment(name, ChildType::Worker, Some(replicas)).written(origin, revision)
    }

    fn flower_service(port: u16) -> ChildRef {
        ChildRef::service(
            "shop-celery-flower",
            ServiceSnapshot {
                type_: Some("ClusterIP".to_string()),
                ports: vec![ServicePortSnapshot {
                    name: Some("http".to_string()),
                    port,
                }],
            },
        )
        .written(WriteOrigin::Create, 1)
    }

    // =========================================================================
    // Resolution Stories
    // =========================================================================

    /// Story: A later update record shadows the create-time record
    #[test]
    fn story_most_recent_write_wins() {
        let children = vec![
            worker("shop-celery-worker", 1, WriteOrigin::Create, 1),
            worker("shop-celery-worker", 4, WriteOrigin::Update, 3),
        ];
        let registry = ChildRegistry::new(&children);

        let live = registry.worker_deployment().unwrap();
        assert_eq!(live.replicas, Some(4));
        assert_eq!(live.recorded_by, WriteOrigin::Update);
    }

    /// Story: At the same revision the update path is authoritative
    #[test]
    fn story_update_beats_create_at_equal_revision() {
        let children = vec![
            worker("shop-celery-worker", 4, WriteOrigin::Update, 2),
            worker("shop-celery-worker", 1, WriteOrigin::Create, 2),
        ];
        let live = ChildRegistry::new(&children).worker_deployment().unwrap();
        assert_eq!(live.replicas, Some(4));
    }

    /// Story: The create record is used until an update exists
    #[test]
    fn story_create_record_is_the_fallback() {
        let children = vec![worker("shop-celery-worker", 2, WriteOrigin::Create, 1)];
        let live = ChildRegistry::new(&children).worker_deployment().unwrap();
        assert_eq!(live.replicas, Some(2));
    }

    /// Story: A status without the child is reported as corrupt, not retried
    #[test]
    fn story_missing_child_is_a_lookup_error() {
        let children = vec![worker("shop-celery-worker", 2, WriteOrigin::Create, 1)];
        let err = ChildRegistry::new(&children).flower_deployment().unwrap_err();

        assert!(matches!(
            err,
            Error::ChildLookup {
                kind: ChildKind::Deployment,
                type_: ChildType::Flower
            }
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kind_and_type_both_discriminate() {
        let children = vec![
            ChildRef::deployment("shop-celery-flower", ChildType::Flower, Some(1)),
            flower_service(5555),
        ];
        let registry = ChildRegistry::new(&children);

        assert_eq!(
            registry.flower_deployment().unwrap().kind,
            ChildKind::Deployment
        );
        assert_eq!(registry.flower_service().unwrap().kind, ChildKind::Service);
        assert!(registry.worker_deployment().is_err());
    }

    #[test]
    fn test_flower_endpoint_uses_recorded_port() {
        let children = vec![flower_service(8080)];
        assert_eq!(
            ChildRegistry::new(&children)
                .flower_endpoint("tasks")
                .unwrap(),
            "shop-celery-flower.tasks:8080"
        );
    }

    #[test]
    fn test_flower_endpoint_without_service_fails() {
        assert!(ChildRegistry::new(&[]).flower_endpoint("tasks").is_err());
    }

    // =========================================================================
    // Merge Stories
    // =========================================================================

    /// Story: Merging replaces in place and leaves siblings untouched
    #[test]
    fn story_merge_replaces_in_place() {
        let mut children = vec![
            worker("shop-celery-worker", 1, WriteOrigin::Create, 1),
            ChildRef::deployment("shop-celery-flower", ChildType::Flower, Some(1)),
            flower_service(5555),
        ];

        ChildRegistry::merge(
            &mut children,
            worker("shop-celery-worker", 5, WriteOrigin::Update, 2),
        );

        assert_eq!(children.len(), 3);
        assert_eq!(children[0].replicas, Some(5));
        assert_eq!(children[1].type_, ChildType::Flower);
        assert_eq!(children[2].kind, ChildKind::Service);
    }

    /// Story: Duplicates left by older status formats collapse on merge
    #[test]
    fn story_merge_collapses_duplicates() {
        let mut children = vec![
            worker("shop-celery-worker", 1, WriteOrigin::Create, 1),
            flower_service(5555),
            worker("shop-celery-worker", 3, WriteOrigin::Update, 2),
        ];

        ChildRegistry::merge(
            &mut children,
            worker("shop-celery-worker", 6, WriteOrigin::Update, 3),
        );

        assert_eq!(children.len(), 2);
        assert_eq!(children[0].replicas, Some(6));
        assert_eq!(children[1].kind, ChildKind::Service);
    }

    #[test]
    fn test_merge_appends_unknown_pair() {
        let mut children = vec![flower_service(5555)];
        ChildRegistry::merge(
            &mut children,
            ChildRef::deployment("shop-celery-worker", ChildType::Worker, Some(1))
                .written(WriteOrigin::Create, 1),
        );
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].type_, ChildType::Worker);
    }
}
