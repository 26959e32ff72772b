use async_trait::async_trait;

use crate::domain::workflow::{OrganizationId, Workflow, WorkflowId};
use crate::domain::workflow_instance::{
    ActivityInstance, WorkflowInstance, WorkflowInstanceId,
};
use crate::EngineError;

/// Parameters for acquiring an exclusive lock on a workflow instance
#[derive(Debug, Clone)]
pub struct LockQuery {
    /// The instance to lock
    pub instance_id: WorkflowInstanceId,
    /// Stable identifier of the engine requesting the lock
    pub owner: String,
}

impl LockQuery {
    /// Lock request for an instance
    pub fn new(instance_id: WorkflowInstanceId, owner: impl Into<String>) -> Self {
        Self {
            instance_id,
            owner: owner.into(),
        }
    }
}

/// Filter for finding or deleting workflow instances
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    /// Match a single instance by id
    pub id: Option<WorkflowInstanceId>,
    /// Match all instances of a workflow definition
    pub workflow_id: Option<WorkflowId>,
    /// Match instances owned by an organization
    pub organization_id: Option<OrganizationId>,
}

impl InstanceQuery {
    /// Match a single instance by id
    pub fn by_id(id: WorkflowInstanceId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// Match all instances of a workflow definition
    pub fn by_workflow_id(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Default::default()
        }
    }

    /// Whether an instance satisfies this filter
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        if let Some(id) = &self.id {
            if &instance.id != id {
                return false;
            }
        }
        if let Some(workflow_id) = &self.workflow_id {
            if &instance.workflow_id != workflow_id {
                return false;
            }
        }
        if let Some(organization_id) = &self.organization_id {
            if instance.organization_id.as_ref() != Some(organization_id) {
                return false;
            }
        }
        true
    }
}

/// Filter for finding workflow definitions
#[derive(Debug, Clone, Default)]
pub struct WorkflowQuery {
    /// Match by definition id
    pub id: Option<WorkflowId>,
    /// Match by definition name
    pub name: Option<String>,
    /// Match definitions owned by an organization
    pub organization_id: Option<OrganizationId>,
}

impl WorkflowQuery {
    /// Match by definition id
    pub fn by_id(id: WorkflowId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// Match by definition name
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Whether a definition satisfies this filter
    pub fn matches(&self, workflow: &Workflow) -> bool {
        if let Some(id) = &self.id {
            if &workflow.id != id {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if workflow.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(organization_id) = &self.organization_id {
            if workflow.organization_id.as_ref() != Some(organization_id) {
                return false;
            }
        }
        true
    }
}

/// Persistence port for workflow definitions
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Store a deployed workflow definition
    async fn insert_workflow(&self, workflow: Workflow) -> Result<(), EngineError>;

    /// Find definitions matching the query
    async fn find_workflows(&self, query: &WorkflowQuery) -> Result<Vec<Workflow>, EngineError>;
}

/// Persistence port for workflow instances
///
/// The store owns id generation, the locking protocol, and the append-only
/// archive of ended activity instances. `flush` may write only the aspects
/// marked dirty in the instance's update tracking, and must reset that
/// tracking on success.
#[async_trait]
pub trait WorkflowInstanceStore: Send + Sync {
    /// Generate a new unique workflow instance id
    async fn generate_workflow_instance_id(&self) -> WorkflowInstanceId;

    /// Store a newly created instance, keeping its lock
    async fn insert_workflow_instance(
        &self,
        instance: &mut WorkflowInstance,
    ) -> Result<(), EngineError>;

    /// Attempt to lock an instance for exclusive mutation
    ///
    /// The check-and-set is atomic. Returns `Ok(None)` when the instance is
    /// currently locked by another owner. A missing instance is an error.
    async fn lock_workflow_instance(
        &self,
        query: &LockQuery,
    ) -> Result<Option<WorkflowInstance>, EngineError>;

    /// Write the dirty aspects of a locked instance, moving ended activity
    /// instances into the archive
    async fn flush(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError>;

    /// Flush and release the lock in one store operation
    async fn flush_and_unlock(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError>;

    /// Release the lock on an instance without writing anything else
    ///
    /// Used on error paths where the in-memory image must not be persisted.
    async fn unlock(&self, id: &WorkflowInstanceId) -> Result<(), EngineError>;

    /// Find instances matching the query
    async fn find_workflow_instances(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<WorkflowInstance>, EngineError>;

    /// Delete instances matching the query, returning how many were removed
    async fn delete_workflow_instances(&self, query: &InstanceQuery) -> Result<usize, EngineError>;

    /// The archived (ended) activity instances of a workflow instance, in
    /// the order they were flushed
    async fn archived_activity_instances(
        &self,
        id: &WorkflowInstanceId,
    ) -> Result<Vec<ActivityInstance>, EngineError>;
}

/// Simple in-process store implementations for tests and examples
#[cfg(any(test, feature = "testing"))]
pub mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use super::*;
    use crate::domain::workflow_instance::InstanceLock;

    /// In-memory workflow definition store
    #[derive(Default)]
    pub struct MemoryWorkflowStore {
        workflows: Arc<RwLock<Vec<Workflow>>>,
    }

    impl MemoryWorkflowStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl WorkflowStore for MemoryWorkflowStore {
        async fn insert_workflow(&self, workflow: Workflow) -> Result<(), EngineError> {
            let mut workflows = self.workflows.write().await;
            workflows.retain(|w| w.id != workflow.id);
            workflows.push(workflow);
            Ok(())
        }

        async fn find_workflows(
            &self,
            query: &WorkflowQuery,
        ) -> Result<Vec<Workflow>, EngineError> {
            let workflows = self.workflows.read().await;
            Ok(workflows
                .iter()
                .filter(|w| query.matches(w))
                .cloned()
                .collect())
        }
    }

    struct InstanceRecord {
        open: WorkflowInstance,
        archived: Vec<ActivityInstance>,
    }

    /// In-memory workflow instance store
    ///
    /// Keeps the full image per flush; the partial-write optimization is a
    /// store concern and invisible to callers.
    #[derive(Default)]
    pub struct MemoryInstanceStore {
        instances: Arc<RwLock<HashMap<WorkflowInstanceId, InstanceRecord>>>,
        next_id: AtomicU64,
    }

    impl MemoryInstanceStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl WorkflowInstanceStore for MemoryInstanceStore {
        async fn generate_workflow_instance_id(&self) -> WorkflowInstanceId {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            WorkflowInstanceId(format!("wfi-{}", n))
        }

        async fn insert_workflow_instance(
            &self,
            instance: &mut WorkflowInstance,
        ) -> Result<(), EngineError> {
            let mut instances = self.instances.write().await;
            instances.insert(
                instance.id.clone(),
                InstanceRecord {
                    open: instance.clone(),
                    archived: Vec::new(),
                },
            );
            instance.updates.reset();
            Ok(())
        }

        async fn lock_workflow_instance(
            &self,
            query: &LockQuery,
        ) -> Result<Option<WorkflowInstance>, EngineError> {
            let mut instances = self.instances.write().await;
            let record = instances
                .get_mut(&query.instance_id)
                .ok_or_else(|| EngineError::InstanceNotFound(query.instance_id.0.clone()))?;

            if record.open.lock.is_some() {
                return Ok(None);
            }

            record.open.lock = Some(InstanceLock {
                time: chrono::Utc::now(),
                owner: query.owner.clone(),
            });
            Ok(Some(record.open.clone()))
        }

        async fn flush(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
            let ended = instance.take_ended();
            let mut instances = self.instances.write().await;
            let record = instances
                .get_mut(&instance.id)
                .ok_or_else(|| EngineError::InstanceNotFound(instance.id.0.clone()))?;
            record.archived.extend(ended);
            record.open = instance.clone();
            record.open.updates.reset();
            instance.updates.reset();
            Ok(())
        }

        async fn flush_and_unlock(
            &self,
            instance: &mut WorkflowInstance,
        ) -> Result<(), EngineError> {
            instance.remove_lock();
            self.flush(instance).await
        }

        async fn unlock(&self, id: &WorkflowInstanceId) -> Result<(), EngineError> {
            let mut instances = self.instances.write().await;
            let record = instances
                .get_mut(id)
                .ok_or_else(|| EngineError::InstanceNotFound(id.0.clone()))?;
            record.open.lock = None;
            Ok(())
        }

        async fn find_workflow_instances(
            &self,
            query: &InstanceQuery,
        ) -> Result<Vec<WorkflowInstance>, EngineError> {
            let instances = self.instances.read().await;
            Ok(instances
                .values()
                .filter(|r| query.matches(&r.open))
                .map(|r| r.open.clone())
                .collect())
        }

        async fn delete_workflow_instances(
            &self,
            query: &InstanceQuery,
        ) -> Result<usize, EngineError> {
            let mut instances = self.instances.write().await;
            let before = instances.len();
            instances.retain(|_, r| !query.matches(&r.open));
            Ok(before - instances.len())
        }

        async fn archived_activity_instances(
            &self,
            id: &WorkflowInstanceId,
        ) -> Result<Vec<ActivityInstance>, EngineError> {
            let instances = self.instances.read().await;
            let record = instances
                .get(id)
                .ok_or_else(|| EngineError::InstanceNotFound(id.0.clone()))?;
            Ok(record.archived.clone())
        }
    }
}
