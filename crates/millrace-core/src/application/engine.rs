use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::retry::{retry_until_some, RetryPolicy};
use crate::domain::cache::{SharedWorkflowCache, WorkflowCache};
use crate::domain::events::{ListenerSet, WorkflowInstanceEventListener};
use crate::domain::repository::{
    InstanceQuery, LockQuery, WorkflowInstanceStore, WorkflowQuery, WorkflowStore,
};
use crate::domain::workflow::{OrganizationId, VariableId, Workflow, WorkflowId};
use crate::domain::workflow_instance::{
    ActivityInstanceId, InstanceLock, ScopeId, WorkState, WorkflowInstance, WorkflowInstanceId,
};
use crate::types::TypedValue;
use crate::{ActivityBehavior, ActivityBehaviorRegistry, ActivityContext, EngineError};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stable identifier of this engine process, stamped into instance locks
    pub owner: String,
    /// Backoff schedule for contended lock acquisition
    pub lock_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner: format!("millrace-{}", Uuid::new_v4()),
            lock_retry: RetryPolicy::default(),
        }
    }
}

/// Parameters for starting a workflow instance
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    /// Root variable values, overriding definition initial values
    pub variables: HashMap<VariableId, TypedValue>,
    /// Organization used to resolve the definition
    pub organization_id: Option<OrganizationId>,
    /// Call-activity linkage: the calling workflow instance
    pub caller_workflow_instance_id: Option<WorkflowInstanceId>,
    /// Call-activity linkage: the calling activity instance
    pub caller_activity_instance_id: Option<ActivityInstanceId>,
}

impl StartParams {
    /// Empty parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a root variable value
    pub fn with_variable(mut self, variable_id: impl Into<String>, value: TypedValue) -> Self {
        self.variables.insert(VariableId(variable_id.into()), value);
        self
    }

    /// Link the new instance back to a calling activity instance, which is
    /// messaged when the new instance ends
    pub fn with_caller(
        mut self,
        workflow_instance_id: WorkflowInstanceId,
        activity_instance_id: ActivityInstanceId,
    ) -> Self {
        self.caller_workflow_instance_id = Some(workflow_instance_id);
        self.caller_activity_instance_id = Some(activity_instance_id);
        self
    }
}

/// Parameters for delivering a message to a waiting activity instance
#[derive(Debug, Clone, Default)]
pub struct MessageParams {
    /// Variable values applied at the target activity's scope before the
    /// message callback runs
    pub variables: HashMap<VariableId, TypedValue>,
    /// Payload handed to the message callback
    pub payload: Option<TypedValue>,
}

impl MessageParams {
    /// Empty parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable value at the target activity's scope
    pub fn with_variable(mut self, variable_id: impl Into<String>, value: TypedValue) -> Self {
        self.variables.insert(VariableId(variable_id.into()), value);
        self
    }

    /// Set the message payload
    pub fn with_payload(mut self, payload: TypedValue) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// The workflow engine
///
/// Cheap to clone; clones share the stores, cache, behavior registry and
/// listener set, which is how spawned asynchronous continuations keep a
/// handle on the engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) workflow_store: Arc<dyn WorkflowStore>,
    pub(crate) instance_store: Arc<dyn WorkflowInstanceStore>,
    pub(crate) cache: Arc<dyn WorkflowCache>,
    pub(crate) behaviors: Arc<ActivityBehaviorRegistry>,
    pub(crate) listeners: ListenerSet,
    pub(crate) config: Arc<EngineConfig>,
}

/// Builder for [`WorkflowEngine`]
#[derive(Default)]
pub struct WorkflowEngineBuilder {
    workflow_store: Option<Arc<dyn WorkflowStore>>,
    instance_store: Option<Arc<dyn WorkflowInstanceStore>>,
    cache: Option<Arc<dyn WorkflowCache>>,
    behaviors: ActivityBehaviorRegistry,
    listeners: Vec<Arc<dyn WorkflowInstanceEventListener>>,
    config: EngineConfig,
}

impl WorkflowEngineBuilder {
    /// Start building an engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the workflow definition store
    pub fn workflow_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.workflow_store = Some(store);
        self
    }

    /// Set the workflow instance store
    pub fn instance_store(mut self, store: Arc<dyn WorkflowInstanceStore>) -> Self {
        self.instance_store = Some(store);
        self
    }

    /// Replace the default shared in-memory workflow cache
    pub fn cache(mut self, cache: Arc<dyn WorkflowCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Register an activity behavior under the given type name
    pub fn behavior(
        mut self,
        behavior_type: impl Into<String>,
        behavior: Arc<dyn ActivityBehavior>,
    ) -> Self {
        self.behaviors.register(behavior_type, behavior);
        self
    }

    /// Register a lifecycle event listener
    pub fn listener(mut self, listener: Arc<dyn WorkflowInstanceEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Override the default configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<WorkflowEngine, EngineError> {
        let workflow_store = self.workflow_store.ok_or_else(|| {
            EngineError::ConfigurationError("workflow store is required".to_string())
        })?;
        let instance_store = self.instance_store.ok_or_else(|| {
            EngineError::ConfigurationError("instance store is required".to_string())
        })?;
        Ok(WorkflowEngine {
            workflow_store,
            instance_store,
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(SharedWorkflowCache::new())),
            behaviors: Arc::new(self.behaviors),
            listeners: ListenerSet::new(self.listeners),
            config: Arc::new(self.config),
        })
    }
}

impl WorkflowEngine {
    /// Store a workflow definition and prime the cache with it
    pub async fn deploy(&self, workflow: Workflow) -> Result<(), EngineError> {
        let shared = Arc::new(workflow.clone());
        self.workflow_store.insert_workflow(workflow).await?;
        info!(
            workflow_id = %shared.id.0,
            version = shared.version,
            "deployed workflow"
        );
        self.cache.put(shared);
        Ok(())
    }

    /// Start a new instance of a workflow, resolved by definition id
    ///
    /// The instance is created already locked by this engine, executed until
    /// its work queue drains (or hands off asynchronously), and unlocked.
    /// Returns the new instance's id.
    pub async fn start_by_id(
        &self,
        workflow_id: &WorkflowId,
        params: StartParams,
    ) -> Result<WorkflowInstanceId, EngineError> {
        let workflow = self
            .resolve_workflow(workflow_id, params.organization_id.as_ref())
            .await?;
        self.start(workflow, params).await
    }

    /// Start a new instance of a workflow, resolved by definition name
    ///
    /// When several versions share the name, the highest version wins.
    pub async fn start_by_name(
        &self,
        name: &str,
        params: StartParams,
    ) -> Result<WorkflowInstanceId, EngineError> {
        let query = WorkflowQuery {
            name: Some(name.to_string()),
            organization_id: params.organization_id.clone(),
            ..Default::default()
        };
        let workflow = self
            .workflow_store
            .find_workflows(&query)
            .await?
            .into_iter()
            .max_by_key(|w| w.version)
            .map(Arc::new)
            .ok_or_else(|| EngineError::WorkflowNotFound(name.to_string()))?;
        self.cache.put(workflow.clone());
        self.start(workflow, params).await
    }

    async fn start(
        &self,
        workflow: Arc<Workflow>,
        params: StartParams,
    ) -> Result<WorkflowInstanceId, EngineError> {
        let id = self.instance_store.generate_workflow_instance_id().await;
        let mut instance = WorkflowInstance::new(id.clone(), &workflow, self.new_lock());
        instance.caller_workflow_instance_id = params.caller_workflow_instance_id;
        instance.caller_activity_instance_id = params.caller_activity_instance_id;

        instance.initialize_scope_variables(ScopeId::Workflow, &workflow.scope.variables);
        for (variable_id, value) in params.variables {
            instance.set_variable(ScopeId::Workflow, &variable_id, value);
        }

        for activity in workflow.scope.start_activities() {
            instance.create_activity_instance(
                ScopeId::Workflow,
                activity,
                Self::initial_work_state(activity),
            );
        }

        self.instance_store
            .insert_workflow_instance(&mut instance)
            .await?;
        info!(
            instance_id = %id.0,
            workflow_id = %workflow.id.0,
            "started workflow instance"
        );

        self.drain(&mut instance, &workflow).await?;
        Ok(id)
    }

    /// Deliver a message to a waiting activity instance
    ///
    /// Locks the instance (with retry), applies the message variables at the
    /// target activity's scope, runs the behavior's message callback, and
    /// drains the resulting work. Targeting an archived activity instance is
    /// [`EngineError::AlreadyEnded`]; an id that was never assigned is
    /// [`EngineError::ActivityInstanceNotFound`]. Those and the other
    /// precondition failures happen before anything runs, so nothing is
    /// flushed and the instance is unlocked again. Once the callback is
    /// reached, a failure leaves the instance locked: stored state is safe
    /// because the failed step was not flushed, but the in-memory tree must
    /// not be exposed to other workers.
    pub async fn send_message(
        &self,
        instance_id: &WorkflowInstanceId,
        activity_instance_id: ActivityInstanceId,
        params: MessageParams,
    ) -> Result<(), EngineError> {
        let mut instance = self
            .lock_with_retry(LockQuery::new(instance_id.clone(), self.config.owner.clone()))
            .await?;

        let workflow = match self.message_target(&instance, activity_instance_id).await {
            Ok(workflow) => workflow,
            Err(err) => {
                self.instance_store.unlock(&instance.id).await?;
                return Err(err);
            }
        };

        self.deliver_message(&mut instance, &workflow, activity_instance_id, params)
            .await
    }

    /// Validate a message target under the held lock
    ///
    /// Every check here runs before the callback and before any mutation, so
    /// a failure lets [`WorkflowEngine::send_message`] release the lock with
    /// stored state untouched.
    async fn message_target(
        &self,
        instance: &WorkflowInstance,
        activity_instance_id: ActivityInstanceId,
    ) -> Result<Arc<Workflow>, EngineError> {
        let workflow = self
            .resolve_workflow(&instance.workflow_id, instance.organization_id.as_ref())
            .await?;

        let activity_instance = match instance.activity_instance(activity_instance_id) {
            Some(ai) => ai,
            None if instance.activity_instance_existed(activity_instance_id) => {
                return Err(EngineError::AlreadyEnded(
                    activity_instance_id.0.to_string(),
                ));
            }
            None => {
                return Err(EngineError::ActivityInstanceNotFound(
                    activity_instance_id.0.to_string(),
                ));
            }
        };
        if activity_instance.work_state != Some(WorkState::Waiting) {
            return Err(EngineError::InvalidState(format!(
                "activity instance {} is not waiting for a message",
                activity_instance_id.0
            )));
        }
        let activity = workflow
            .find_activity(&activity_instance.activity_id)
            .ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "activity {} not found in workflow {}",
                    activity_instance.activity_id.0, workflow.id.0
                ))
            })?;
        self.behaviors.get(&activity.behavior_type)?;
        Ok(workflow)
    }

    async fn deliver_message(
        &self,
        instance: &mut WorkflowInstance,
        workflow: &Arc<Workflow>,
        activity_instance_id: ActivityInstanceId,
        params: MessageParams,
    ) -> Result<(), EngineError> {
        let activity_id = instance
            .activity_instance(activity_instance_id)
            .map(|ai| ai.activity_id.clone())
            .ok_or_else(|| {
                EngineError::ActivityInstanceNotFound(activity_instance_id.0.to_string())
            })?;
        let activity = workflow.find_activity(&activity_id).ok_or_else(|| {
            EngineError::InvalidState(format!(
                "activity {} not found in workflow {}",
                activity_id.0, workflow.id.0
            ))
        })?;

        debug!(
            instance_id = %instance.id.0,
            activity_instance_id = activity_instance_id.0,
            "delivering message"
        );
        for (variable_id, value) in &params.variables {
            instance.set_variable(
                ScopeId::Activity(activity_instance_id),
                variable_id,
                value.clone(),
            );
        }

        let behavior = self.behaviors.get(&activity.behavior_type)?;
        let mut context =
            ActivityContext::new(instance, activity_instance_id, activity, params.payload);
        let outcome = behavior.message(&mut context).await?;
        self.apply_outcome(instance, workflow, activity_instance_id, activity, outcome)
            .await?;

        self.drain(instance, workflow).await
    }

    /// Find workflow instances matching the query
    pub async fn find_workflow_instances(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        self.instance_store.find_workflow_instances(query).await
    }

    /// Delete workflow instances matching the query, returning how many
    /// were removed
    pub async fn delete_workflow_instances(
        &self,
        query: &InstanceQuery,
    ) -> Result<usize, EngineError> {
        let deleted = self.instance_store.delete_workflow_instances(query).await?;
        info!(deleted, "deleted workflow instances");
        Ok(deleted)
    }

    /// Find workflow definitions matching the query
    pub async fn find_workflows(
        &self,
        query: &WorkflowQuery,
    ) -> Result<Vec<Workflow>, EngineError> {
        self.workflow_store.find_workflows(query).await
    }

    pub(crate) async fn resolve_workflow(
        &self,
        workflow_id: &WorkflowId,
        organization_id: Option<&OrganizationId>,
    ) -> Result<Arc<Workflow>, EngineError> {
        if let Some(workflow) = self.cache.get(workflow_id, organization_id) {
            return Ok(workflow);
        }
        let query = WorkflowQuery {
            id: Some(workflow_id.clone()),
            organization_id: organization_id.cloned(),
            ..Default::default()
        };
        let workflow = self
            .workflow_store
            .find_workflows(&query)
            .await?
            .into_iter()
            .max_by_key(|w| w.version)
            .map(Arc::new)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.0.clone()))?;
        self.cache.put(workflow.clone());
        Ok(workflow)
    }

    pub(crate) async fn lock_with_retry(
        &self,
        query: LockQuery,
    ) -> Result<WorkflowInstance, EngineError> {
        let description = format!("lock on instance {}", query.instance_id.0);
        let store = self.instance_store.clone();
        retry_until_some(&self.config.lock_retry, &description, || {
            let store = store.clone();
            let query = query.clone();
            async move { store.lock_workflow_instance(&query).await }
        })
        .await
    }

    pub(crate) fn new_lock(&self) -> InstanceLock {
        InstanceLock {
            time: Utc::now(),
            owner: self.config.owner.clone(),
        }
    }

    pub(crate) fn initial_work_state(activity: &crate::domain::workflow::Activity) -> WorkState {
        if activity.multi_instance.is_some() {
            WorkState::StartingMultiContainer
        } else {
            WorkState::Starting
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::memory::{MemoryInstanceStore, MemoryWorkflowStore};

    #[test]
    fn test_builder_requires_stores() {
        let result = WorkflowEngineBuilder::new().build();
        assert!(matches!(result, Err(EngineError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_deploy_primes_cache() {
        let engine = WorkflowEngineBuilder::new()
            .workflow_store(Arc::new(MemoryWorkflowStore::new()))
            .instance_store(Arc::new(MemoryInstanceStore::new()))
            .build()
            .unwrap();

        let workflow = Workflow::new("wf1").with_name("invoice");
        engine.deploy(workflow).await.unwrap();

        assert!(engine.cache.get(&WorkflowId("wf1".to_string()), None).is_some());
        let found = engine
            .find_workflows(&WorkflowQuery::by_name("invoice"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_start_unknown_workflow() {
        let engine = WorkflowEngineBuilder::new()
            .workflow_store(Arc::new(MemoryWorkflowStore::new()))
            .instance_store(Arc::new(MemoryInstanceStore::new()))
            .build()
            .unwrap();

        let result = engine
            .start_by_id(&WorkflowId("missing".to_string()), StartParams::new())
            .await;
        assert_eq!(
            result,
            Err(EngineError::WorkflowNotFound("missing".to_string()))
        );
    }
}
