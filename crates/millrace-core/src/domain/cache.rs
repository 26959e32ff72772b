//! Workflow definition cache
//!
//! Compiled definitions are immutable after deployment, so the engine caches
//! them per process to avoid re-loading per instance start. No eviction is
//! performed; entries live for the process lifetime. A collaborator may swap
//! in a different cache implementation via the engine builder.

use std::sync::Arc;

use dashmap::DashMap;

use super::workflow::{OrganizationId, Workflow, WorkflowId};

/// Keyed lookup of compiled workflow definitions
pub trait WorkflowCache: Send + Sync {
    /// Look up a cached definition by (workflow id, organization id)
    fn get(
        &self,
        id: &WorkflowId,
        organization_id: Option<&OrganizationId>,
    ) -> Option<Arc<Workflow>>;

    /// Cache a definition under its own (id, organization) key
    fn put(&self, workflow: Arc<Workflow>);
}

/// Default concurrent in-process cache
#[derive(Default)]
pub struct SharedWorkflowCache {
    entries: DashMap<(WorkflowId, Option<OrganizationId>), Arc<Workflow>>,
}

impl SharedWorkflowCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowCache for SharedWorkflowCache {
    fn get(
        &self,
        id: &WorkflowId,
        organization_id: Option<&OrganizationId>,
    ) -> Option<Arc<Workflow>> {
        self.entries
            .get(&(id.clone(), organization_id.cloned()))
            .map(|entry| entry.value().clone())
    }

    fn put(&self, workflow: Arc<Workflow>) {
        let key = (workflow.id.clone(), workflow.organization_id.clone());
        self.entries.insert(key, workflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let cache = SharedWorkflowCache::new();
        let workflow = Arc::new(Workflow::new("wf1"));

        assert!(cache.get(&workflow.id, None).is_none());

        cache.put(workflow.clone());
        let found = cache.get(&workflow.id, None).expect("cached");
        assert_eq!(found.id, workflow.id);
    }

    #[test]
    fn test_organization_scoping() {
        let cache = SharedWorkflowCache::new();
        let tenant_a = Arc::new(Workflow::new("wf1").with_organization("acme"));
        cache.put(tenant_a.clone());

        // Same workflow id under a different tenant key is a miss
        assert!(cache.get(&tenant_a.id, None).is_none());

        let org = OrganizationId("acme".to_string());
        assert!(cache.get(&tenant_a.id, Some(&org)).is_some());
    }
}
