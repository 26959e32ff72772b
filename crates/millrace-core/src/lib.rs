//!
//! Millrace Core - embeddable workflow execution engine
//!
//! This crate defines the workflow definition model, the runtime instance
//! tree with its activity-instance state machine, the work-queue scheduler,
//! the lock/retry protocol, and the store traits persistence backends
//! implement. Activity semantics are pluggable through [`ActivityBehavior`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Domain layer - definitions, instance tree, ports
pub mod domain;

/// Application services - engine operations and the execution loop
pub mod application;

/// Core value types
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::EngineError;
pub use types::{DataType, TypedValue};

pub use domain::cache::{SharedWorkflowCache, WorkflowCache};
pub use domain::events::{ListenerSet, WorkflowInstanceEventListener};
pub use domain::repository::{
    InstanceQuery, LockQuery, WorkflowInstanceStore, WorkflowQuery, WorkflowStore,
};
pub use domain::workflow::{
    Activity, ActivityId, Binding, MultiInstance, OrganizationId, Scope, Transition, TransitionId,
    Variable, VariableId, Workflow, WorkflowId,
};
pub use domain::workflow_instance::{
    ActivityInstance, ActivityInstanceId, InstanceLock, ScopeId, VariableInstance,
    VariableInstanceId, WorkState, WorkflowInstance, WorkflowInstanceId,
};

pub use application::engine::{
    EngineConfig, MessageParams, StartParams, WorkflowEngine, WorkflowEngineBuilder,
};
pub use application::retry::RetryPolicy;

/// Outcome of an activity behavior callback, telling the engine how to
/// continue with the subject activity instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// Stay open and wait for an external message
    Wait,
    /// End the activity instance and take its outgoing transitions
    Onwards,
    /// End the activity instance without routing, notifying the parent scope
    End,
}

/// Runtime context handed to activity behavior callbacks
///
/// Variable access reads and writes through the activity instance's scope,
/// falling back to enclosing scopes up to the workflow root.
pub struct ActivityContext<'a> {
    instance: &'a mut WorkflowInstance,
    activity_instance_id: ActivityInstanceId,
    activity: &'a Activity,
    message: Option<TypedValue>,
}

impl<'a> ActivityContext<'a> {
    /// Build a context for one callback invocation
    pub fn new(
        instance: &'a mut WorkflowInstance,
        activity_instance_id: ActivityInstanceId,
        activity: &'a Activity,
        message: Option<TypedValue>,
    ) -> Self {
        Self {
            instance,
            activity_instance_id,
            activity,
            message,
        }
    }

    /// The subject activity instance id
    pub fn activity_instance_id(&self) -> ActivityInstanceId {
        self.activity_instance_id
    }

    /// The activity definition being executed
    pub fn activity(&self) -> &Activity {
        self.activity
    }

    /// The workflow instance, read-only
    pub fn workflow_instance(&self) -> &WorkflowInstance {
        self.instance
    }

    /// The payload of the message being delivered, if any
    pub fn message(&self) -> Option<&TypedValue> {
        self.message.as_ref()
    }

    /// Read a variable, resolved from this activity's scope outward
    pub fn variable(&self, variable_id: &VariableId) -> Option<TypedValue> {
        self.instance
            .variable_value(self.scope(), variable_id)
            .cloned()
    }

    /// Write a variable in the scope that declares it, or bind it in this
    /// activity's scope if undeclared
    pub fn set_variable(&mut self, variable_id: &VariableId, value: TypedValue) {
        self.instance.set_variable(self.scope(), variable_id, value);
    }

    fn scope(&self) -> ScopeId {
        ScopeId::Activity(self.activity_instance_id)
    }
}

/// Pluggable activity semantics, selected by an activity definition's
/// `behavior_type`
#[async_trait]
pub trait ActivityBehavior: Send + Sync {
    /// Called once when the activity instance starts
    async fn start(&self, context: &mut ActivityContext<'_>)
        -> Result<ActivityOutcome, EngineError>;

    /// Called when a message is delivered to a waiting instance
    ///
    /// Behaviors that never wait keep the default, which rejects the
    /// message.
    async fn message(
        &self,
        context: &mut ActivityContext<'_>,
    ) -> Result<ActivityOutcome, EngineError> {
        Err(EngineError::InvalidState(format!(
            "activity {} does not accept messages",
            context.activity().id.0
        )))
    }
}

/// Registry of activity behaviors, keyed by behavior type
///
/// Populated once at engine build time and shared immutably afterwards.
#[derive(Default)]
pub struct ActivityBehaviorRegistry {
    behaviors: HashMap<String, Arc<dyn ActivityBehavior>>,
}

impl ActivityBehaviorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a behavior under the given type name, replacing any
    /// previous registration
    pub fn register(
        &mut self,
        behavior_type: impl Into<String>,
        behavior: Arc<dyn ActivityBehavior>,
    ) {
        self.behaviors.insert(behavior_type.into(), behavior);
    }

    /// Resolve a behavior by type name
    pub fn get(&self, behavior_type: &str) -> Result<Arc<dyn ActivityBehavior>, EngineError> {
        self.behaviors
            .get(behavior_type)
            .cloned()
            .ok_or_else(|| EngineError::BehaviorNotFound(behavior_type.to_string()))
    }
}

/// Behavior for start events: proceed onward immediately
#[derive(Debug, Default)]
pub struct StartEventBehavior;

#[async_trait]
impl ActivityBehavior for StartEventBehavior {
    async fn start(
        &self,
        _context: &mut ActivityContext<'_>,
    ) -> Result<ActivityOutcome, EngineError> {
        Ok(ActivityOutcome::Onwards)
    }
}

/// Behavior for end events: end the path without routing
#[derive(Debug, Default)]
pub struct EndEventBehavior;

#[async_trait]
impl ActivityBehavior for EndEventBehavior {
    async fn start(
        &self,
        _context: &mut ActivityContext<'_>,
    ) -> Result<ActivityOutcome, EngineError> {
        Ok(ActivityOutcome::End)
    }
}

/// Behavior for receive tasks: wait for an external message, then proceed
///
/// The message payload, if any, is stored in the variable named by
/// `payload_variable` before routing onward.
#[derive(Debug, Default)]
pub struct ReceiveTaskBehavior {
    /// Variable to bind the message payload to, if set
    pub payload_variable: Option<VariableId>,
}

impl ReceiveTaskBehavior {
    /// A receive task that discards the message payload
    pub fn new() -> Self {
        Self::default()
    }

    /// A receive task that binds the message payload to the given variable
    pub fn with_payload_variable(variable_id: impl Into<String>) -> Self {
        Self {
            payload_variable: Some(VariableId(variable_id.into())),
        }
    }
}

#[async_trait]
impl ActivityBehavior for ReceiveTaskBehavior {
    async fn start(
        &self,
        _context: &mut ActivityContext<'_>,
    ) -> Result<ActivityOutcome, EngineError> {
        Ok(ActivityOutcome::Wait)
    }

    async fn message(
        &self,
        context: &mut ActivityContext<'_>,
    ) -> Result<ActivityOutcome, EngineError> {
        if let Some(variable_id) = &self.payload_variable {
            if let Some(payload) = context.message().cloned() {
                context.set_variable(variable_id, payload);
            }
        }
        Ok(ActivityOutcome::Onwards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context_fixture() -> (WorkflowInstance, Activity) {
        let activity = Activity::new("receive", "receiveTask");
        let workflow = Workflow::new("wf1");
        let mut instance = WorkflowInstance::new(
            WorkflowInstanceId("i1".to_string()),
            &workflow,
            InstanceLock {
                time: chrono::Utc::now(),
                owner: "engine-test".to_string(),
            },
        );
        instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);
        (instance, activity)
    }

    #[tokio::test]
    async fn test_receive_task_waits_then_proceeds() {
        let (mut instance, activity) = context_fixture();
        let behavior = ReceiveTaskBehavior::with_payload_variable("payload");
        let id = ActivityInstanceId(1);

        let mut context = ActivityContext::new(&mut instance, id, &activity, None);
        assert_eq!(behavior.start(&mut context).await, Ok(ActivityOutcome::Wait));

        let mut context = ActivityContext::new(
            &mut instance,
            id,
            &activity,
            Some(TypedValue::new(json!({"ok": true}))),
        );
        assert_eq!(
            behavior.message(&mut context).await,
            Ok(ActivityOutcome::Onwards)
        );

        let stored = instance
            .variable_value(ScopeId::Activity(id), &VariableId("payload".to_string()))
            .unwrap();
        assert_eq!(stored.as_value(), &json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_default_message_callback_rejects() {
        let (mut instance, activity) = context_fixture();
        let behavior = StartEventBehavior;
        let mut context =
            ActivityContext::new(&mut instance, ActivityInstanceId(1), &activity, None);
        let result = behavior.message(&mut context).await;
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ActivityBehaviorRegistry::new();
        registry.register("startEvent", Arc::new(StartEventBehavior));

        assert!(registry.get("startEvent").is_ok());
        assert_eq!(
            registry.get("unknown").err(),
            Some(EngineError::BehaviorNotFound("unknown".to_string()))
        );
    }
}
