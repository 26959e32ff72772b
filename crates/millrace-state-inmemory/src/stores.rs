use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use millrace_core::domain::repository::{
    InstanceQuery, LockQuery, WorkflowInstanceStore, WorkflowQuery, WorkflowStore,
};
use millrace_core::{
    ActivityInstance, EngineError, InstanceLock, Workflow, WorkflowInstance, WorkflowInstanceId,
};

/// In-memory implementation of the workflow definition store
///
/// Definitions are keyed by id and version, so several versions of the same
/// workflow can coexist.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: Arc<RwLock<Vec<Workflow>>>,
}

impl InMemoryWorkflowStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert_workflow(&self, workflow: Workflow) -> Result<(), EngineError> {
        let mut workflows = self.workflows.write().await;
        workflows.retain(|w| !(w.id == workflow.id && w.version == workflow.version));
        workflows.push(workflow);
        Ok(())
    }

    async fn find_workflows(&self, query: &WorkflowQuery) -> Result<Vec<Workflow>, EngineError> {
        let workflows = self.workflows.read().await;
        Ok(workflows
            .iter()
            .filter(|w| query.matches(w))
            .cloned()
            .collect())
    }
}

struct InstanceRecord {
    /// The persisted image of the open instance
    image: WorkflowInstance,
    /// Append-only archive of ended activity instances, in flush order
    archived: Vec<ActivityInstance>,
    /// Names of the aspects the most recent flush wrote
    last_flush: Vec<&'static str>,
}

/// In-memory implementation of the workflow instance store
///
/// Each flush writes only the aspects the instance's dirty tracking marks,
/// and records their names; [`InMemoryWorkflowInstanceStore::flushed_aspects`]
/// exposes that record, which makes the partial-update and no-op flush
/// behaviors directly assertable in tests.
#[derive(Default)]
pub struct InMemoryWorkflowInstanceStore {
    instances: Arc<RwLock<HashMap<WorkflowInstanceId, InstanceRecord>>>,
}

impl InMemoryWorkflowInstanceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// The aspect names written by the most recent flush of an instance
    pub async fn flushed_aspects(
        &self,
        id: &WorkflowInstanceId,
    ) -> Result<Vec<&'static str>, EngineError> {
        let instances = self.instances.read().await;
        let record = instances
            .get(id)
            .ok_or_else(|| EngineError::InstanceNotFound(id.0.clone()))?;
        Ok(record.last_flush.clone())
    }
}

#[async_trait]
impl WorkflowInstanceStore for InMemoryWorkflowInstanceStore {
    async fn generate_workflow_instance_id(&self) -> WorkflowInstanceId {
        WorkflowInstanceId(Uuid::new_v4().to_string())
    }

    async fn insert_workflow_instance(
        &self,
        instance: &mut WorkflowInstance,
    ) -> Result<(), EngineError> {
        let mut instances = self.instances.write().await;
        let mut image = instance.clone();
        image.updates.reset();
        instances.insert(
            instance.id.clone(),
            InstanceRecord {
                image,
                archived: Vec::new(),
                last_flush: vec!["insert"],
            },
        );
        instance.updates.reset();
        Ok(())
    }

    async fn lock_workflow_instance(
        &self,
        query: &LockQuery,
    ) -> Result<Option<WorkflowInstance>, EngineError> {
        // Check-and-set under the write guard keeps the lock atomic.
        let mut instances = self.instances.write().await;
        let record = instances
            .get_mut(&query.instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(query.instance_id.0.clone()))?;

        if record.image.lock.is_some() {
            debug!(
                instance_id = %query.instance_id.0,
                "lock contended"
            );
            return Ok(None);
        }
        record.image.lock = Some(InstanceLock {
            time: chrono::Utc::now(),
            owner: query.owner.clone(),
        });
        Ok(Some(record.image.clone()))
    }

    async fn flush(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
        let ended = instance.take_ended();
        let mut instances = self.instances.write().await;
        let record = instances
            .get_mut(&instance.id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance.id.0.clone()))?;

        let mut written: Vec<&'static str> = Vec::new();
        if instance.updates.end_changed {
            record.image.end = instance.end;
            record.image.duration_millis = instance.duration_millis;
            written.push("end");
        }
        if instance.updates.activity_instances_changed {
            record.image.activity_instances = instance.activity_instances.clone();
            record.archived.extend(ended);
            written.push("activityInstances");
        }
        if instance.updates.variable_instances_changed {
            record.image.variable_instances = instance.variable_instances.clone();
            written.push("variableInstances");
        }
        if instance.updates.work_changed {
            record.image.work = instance.work.clone();
            record.image.switched_async = instance.switched_async;
            written.push("work");
        }
        if instance.updates.work_async_changed {
            record.image.work_async = instance.work_async.clone();
            record.image.switched_async = instance.switched_async;
            written.push("workAsync");
        }
        if instance.updates.next_ids_changed {
            record.image.next_activity_instance_id = instance.next_activity_instance_id;
            record.image.next_variable_instance_id = instance.next_variable_instance_id;
            written.push("nextIds");
        }
        if instance.updates.lock_changed {
            record.image.lock = instance.lock.clone();
            written.push("lock");
        }

        debug!(
            instance_id = %instance.id.0,
            aspects = ?written,
            "flushed instance"
        );
        record.last_flush = written;
        instance.updates.reset();
        Ok(())
    }

    async fn flush_and_unlock(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
        instance.remove_lock();
        self.flush(instance).await
    }

    async fn unlock(&self, id: &WorkflowInstanceId) -> Result<(), EngineError> {
        let mut instances = self.instances.write().await;
        let record = instances
            .get_mut(id)
            .ok_or_else(|| EngineError::InstanceNotFound(id.0.clone()))?;
        record.image.lock = None;
        Ok(())
    }

    async fn find_workflow_instances(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|r| query.matches(&r.image))
            .map(|r| r.image.clone())
            .collect())
    }

    async fn delete_workflow_instances(&self, query: &InstanceQuery) -> Result<usize, EngineError> {
        let mut instances = self.instances.write().await;
        let before = instances.len();
        instances.retain(|_, r| !query.matches(&r.image));
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
