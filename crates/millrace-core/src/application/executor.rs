//! Work-queue drain loop and the per-state execution step
//!
//! One dequeued activity instance id maps to exactly one state-machine
//! step. Between steps the dirty deltas are flushed, so a crash loses at
//! most the step in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::application::engine::{MessageParams, WorkflowEngine};
use crate::domain::repository::LockQuery;
use crate::domain::workflow::{Activity, Binding, Workflow};
use crate::domain::workflow_instance::{
    ActivityInstanceId, ScopeId, WorkState, WorkflowInstance, WorkflowInstanceId,
};
use crate::types::TypedValue;
use crate::{ActivityContext, ActivityOutcome, EngineError};

/// Whether this instance is one element of a multi-instance fan-out
///
/// Elements share their container's activity definition, so they are
/// recognized by a parent activity instance executing the same activity.
fn is_element_instance(instance: &WorkflowInstance, id: ActivityInstanceId) -> bool {
    let Some(activity_instance) = instance.activity_instance(id) else {
        return false;
    };
    match activity_instance.parent {
        ScopeId::Activity(parent_id) => instance
            .activity_instance(parent_id)
            .map(|p| p.activity_id == activity_instance.activity_id)
            .unwrap_or(false),
        ScopeId::Workflow => false,
    }
}

impl WorkflowEngine {
    /// Drain the primary work queue of a locked instance
    ///
    /// The first step runs on the in-memory image as inserted or locked; each
    /// subsequent step is preceded by an incremental flush. When the queue
    /// empties with deferred asynchronous work pending, that work is promoted
    /// and execution hands off to a spawned continuation; otherwise the
    /// instance is flushed and unlocked, ending the cycle. Behavior failures
    /// propagate uncaught and leave the instance locked.
    pub(crate) async fn drain(
        &self,
        instance: &mut WorkflowInstance,
        workflow: &Arc<Workflow>,
    ) -> Result<(), EngineError> {
        let mut first = true;
        while let Some(id) = instance.next_work() {
            if !first {
                self.instance_store.flush(instance).await?;
            }
            first = false;
            self.execute_step(instance, workflow, id).await?;
        }

        if !instance.work_async.is_empty() {
            instance.switch_to_async();
            self.instance_store.flush_and_unlock(instance).await?;
            debug!(
                instance_id = %instance.id.0,
                "handing off to asynchronous continuation"
            );
            let engine = self.clone();
            tokio::spawn(engine.resume_async(instance.id.clone(), workflow.clone()));
            return Ok(());
        }

        self.maybe_end_workflow(instance).await;
        self.instance_store.flush_and_unlock(instance).await?;
        if instance.end.is_some() {
            self.notify_caller(instance);
        }
        Ok(())
    }

    /// The spawned continuation after an asynchronous handoff: re-lock with
    /// retry and re-enter the drain loop
    pub(crate) fn resume_async(
        self,
        instance_id: WorkflowInstanceId,
        workflow: Arc<Workflow>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let query = LockQuery::new(instance_id.clone(), self.config.owner.clone());
            let mut instance = match self.lock_with_retry(query).await {
                Ok(instance) => instance,
                Err(err) => {
                    error!(
                        instance_id = %instance_id.0,
                        error = %err,
                        "failed to re-lock instance for asynchronous continuation"
                    );
                    return;
                }
            };
            if let Err(err) = self.drain(&mut instance, &workflow).await {
                error!(
                    instance_id = %instance_id.0,
                    error = %err,
                    "asynchronous continuation failed, instance left locked"
                );
            }
        })
    }

    async fn execute_step(
        &self,
        instance: &mut WorkflowInstance,
        workflow: &Arc<Workflow>,
        id: ActivityInstanceId,
    ) -> Result<(), EngineError> {
        let (work_state, parent) = match instance.activity_instance(id) {
            Some(activity_instance) => match activity_instance.work_state {
                Some(state) => (state, activity_instance.parent),
                // Ended while queued, nothing to do
                None => return Ok(()),
            },
            None => return Ok(()),
        };
        debug!(
            instance_id = %instance.id.0,
            activity_instance_id = id.0,
            work_state = ?work_state,
            "executing work item"
        );

        match work_state {
            WorkState::Starting | WorkState::StartingMultiInstance => {
                self.start_activity(instance, workflow, id).await
            }
            WorkState::StartingMultiContainer => {
                self.start_multi_container(instance, workflow, id).await
            }
            WorkState::Notifying => {
                self.notify_parent_of_end(instance, workflow, id, parent)
                    .await
            }
            // Waiting instances only move on an external message
            WorkState::Waiting => Ok(()),
        }
    }

    async fn start_activity(
        &self,
        instance: &mut WorkflowInstance,
        workflow: &Arc<Workflow>,
        id: ActivityInstanceId,
    ) -> Result<(), EngineError> {
        let activity = self.subject_activity(instance, workflow, id)?;
        if let Some(snapshot) = instance.activity_instance(id).cloned() {
            self.listeners
                .activity_instance_started(instance, &snapshot)
                .await;
        }

        let behavior = self.behaviors.get(&activity.behavior_type)?;
        let mut context = ActivityContext::new(instance, id, activity, None);
        let outcome = behavior.start(&mut context).await?;
        self.apply_outcome(instance, workflow, id, activity, outcome)
            .await
    }

    async fn start_multi_container(
        &self,
        instance: &mut WorkflowInstance,
        workflow: &Arc<Workflow>,
        id: ActivityInstanceId,
    ) -> Result<(), EngineError> {
        let activity = self.subject_activity(instance, workflow, id)?;
        let multi_instance = activity.multi_instance.as_ref().ok_or_else(|| {
            EngineError::InvalidState(format!(
                "activity {} has no multi-instance definition",
                activity.id.0
            ))
        })?;

        let collection = match &multi_instance.collection {
            Binding::Value(value) => value.clone(),
            Binding::VariableRef(variable_id) => instance
                .variable_value(ScopeId::Activity(id), variable_id)
                .cloned()
                .unwrap_or_else(TypedValue::null),
        };
        let elements = collection.as_array().cloned().unwrap_or_default();

        if elements.is_empty() {
            debug!(
                instance_id = %instance.id.0,
                activity_instance_id = id.0,
                "empty multi-instance collection, proceeding onward"
            );
            return self.onwards(instance, workflow, id, activity).await;
        }

        instance.set_work_state(id, WorkState::Waiting);
        for element in elements {
            let child = instance.create_activity_instance(
                ScopeId::Activity(id),
                activity,
                WorkState::StartingMultiInstance,
            );
            instance.create_variable_instance(
                ScopeId::Activity(child),
                multi_instance.element_variable.id.clone(),
                TypedValue::new(element),
            );
        }
        Ok(())
    }

    /// Parent-completion logic, run after a child reported its end
    async fn notify_parent_of_end(
        &self,
        instance: &mut WorkflowInstance,
        workflow: &Arc<Workflow>,
        id: ActivityInstanceId,
        parent: ScopeId,
    ) -> Result<(), EngineError> {
        // Clear the terminal marker first so completion scans below count
        // this instance as ended.
        instance.clear_work_state(id);

        match parent {
            ScopeId::Workflow => {
                self.maybe_end_workflow(instance).await;
                Ok(())
            }
            ScopeId::Activity(parent_id) => {
                let parent_state = match instance.activity_instance(parent_id) {
                    Some(parent_instance) => parent_instance.work_state,
                    None => return Ok(()),
                };
                // A waiting parent (multi-instance container or composite
                // scope) completes when its last child ends; re-checked on
                // every child end.
                if parent_state == Some(WorkState::Waiting)
                    && instance.open_children(parent_id).is_empty()
                {
                    let parent_activity = self.subject_activity(instance, workflow, parent_id)?;
                    self.onwards(instance, workflow, parent_id, parent_activity)
                        .await?;
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn apply_outcome(
        &self,
        instance: &mut WorkflowInstance,
        workflow: &Arc<Workflow>,
        id: ActivityInstanceId,
        activity: &Activity,
        outcome: ActivityOutcome,
    ) -> Result<(), EngineError> {
        match outcome {
            ActivityOutcome::Wait => {
                instance.set_work_state(id, WorkState::Waiting);
                Ok(())
            }
            ActivityOutcome::Onwards => self.onwards(instance, workflow, id, activity).await,
            ActivityOutcome::End => self.end_activity(instance, id, true).await,
        }
    }

    /// End an activity instance and route along its outgoing transitions
    ///
    /// Each outgoing transition is taken in definition order, creating a new
    /// instance of its target activity in the same parent scope. With no
    /// outgoing transitions the parent scope is notified instead. Elements
    /// of a multi-instance fan-out never take the container's transitions;
    /// they always report to the container.
    async fn onwards(
        &self,
        instance: &mut WorkflowInstance,
        workflow: &Arc<Workflow>,
        id: ActivityInstanceId,
        activity: &Activity,
    ) -> Result<(), EngineError> {
        if is_element_instance(instance, id) {
            return self.end_activity(instance, id, true).await;
        }

        let scope = workflow.containing_scope(&activity.id).ok_or_else(|| {
            EngineError::InvalidState(format!(
                "activity {} not found in workflow {}",
                activity.id.0, workflow.id.0
            ))
        })?;
        let outgoing = scope.outgoing(&activity.id);
        let parent = instance
            .activity_instance(id)
            .map(|activity_instance| activity_instance.parent)
            .ok_or_else(|| EngineError::ActivityInstanceNotFound(id.0.to_string()))?;

        if outgoing.is_empty() {
            return self.end_activity(instance, id, true).await;
        }

        self.end_activity(instance, id, false).await?;
        for transition in outgoing {
            self.listeners.transition_taken(instance, transition).await;
            let target = scope.activity(&transition.to).ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "transition {} targets unknown activity {}",
                    transition.id.0, transition.to.0
                ))
            })?;
            instance.create_activity_instance(parent, target, Self::initial_work_state(target));
        }
        Ok(())
    }

    async fn end_activity(
        &self,
        instance: &mut WorkflowInstance,
        id: ActivityInstanceId,
        notify_parent: bool,
    ) -> Result<(), EngineError> {
        instance.end_activity_instance(id, notify_parent)?;
        if let Some(snapshot) = instance.activity_instance(id).cloned() {
            self.listeners
                .activity_instance_ended(instance, &snapshot)
                .await;
        }
        Ok(())
    }

    /// End the workflow instance once nothing remains to execute
    async fn maybe_end_workflow(&self, instance: &mut WorkflowInstance) {
        if instance.end.is_none()
            && instance.work.is_empty()
            && instance.work_async.is_empty()
            && !instance.has_open_activity_instances()
        {
            instance.end();
            info!(instance_id = %instance.id.0, "workflow instance ended");
            self.listeners.workflow_instance_ended(instance).await;
        }
    }

    /// Message the caller of an ended sub-process instance, carrying the
    /// sub-instance's root variables as the payload
    ///
    /// The delivery runs on a spawned task: a call activity that completes
    /// its sub-instance synchronously reaches this point while the caller is
    /// still locked by the drain executing the call activity itself, so an
    /// inline delivery could never acquire the caller's lock. The spawned
    /// task's lock retry succeeds once the caller's own drain unlocks. A
    /// caller that vanished (or whose call activity already finished) is
    /// skipped with a warning.
    fn notify_caller(&self, instance: &WorkflowInstance) {
        let (Some(caller_id), Some(caller_activity_instance_id)) = (
            instance.caller_workflow_instance_id.clone(),
            instance.caller_activity_instance_id,
        ) else {
            return;
        };

        let mut payload = serde_json::Map::new();
        for variable in instance
            .variable_instances
            .values()
            .filter(|v| v.scope == ScopeId::Workflow)
        {
            payload.insert(
                variable.variable_id.0.clone(),
                variable.value.as_value().clone(),
            );
        }
        let params =
            MessageParams::new().with_payload(TypedValue::new(serde_json::Value::Object(payload)));

        debug!(
            instance_id = %instance.id.0,
            caller_instance_id = %caller_id.0,
            "notifying caller of completion"
        );
        let engine = self.clone();
        let sub_instance_id = instance.id.clone();
        tokio::spawn(async move {
            match engine
                .send_message(&caller_id, caller_activity_instance_id, params)
                .await
            {
                Ok(()) => {}
                Err(
                    EngineError::InstanceNotFound(_)
                    | EngineError::ActivityInstanceNotFound(_)
                    | EngineError::AlreadyEnded(_)
                    | EngineError::InvalidState(_),
                ) => {
                    warn!(
                        instance_id = %sub_instance_id.0,
                        caller_instance_id = %caller_id.0,
                        "caller vanished before completion notification, skipping"
                    );
                }
                Err(err) => {
                    error!(
                        instance_id = %sub_instance_id.0,
                        caller_instance_id = %caller_id.0,
                        error = %err,
                        "failed to notify caller of completion"
                    );
                }
            }
        });
    }

    fn subject_activity<'w>(
        &self,
        instance: &WorkflowInstance,
        workflow: &'w Arc<Workflow>,
        id: ActivityInstanceId,
    ) -> Result<&'w Activity, EngineError> {
        let activity_id = instance
            .activity_instance(id)
            .map(|activity_instance| activity_instance.activity_id.clone())
            .ok_or_else(|| EngineError::ActivityInstanceNotFound(id.0.to_string()))?;
        workflow.find_activity(&activity_id).ok_or_else(|| {
            EngineError::InvalidState(format!(
                "activity {} not found in workflow {}",
                activity_id.0, workflow.id.0
            ))
        })
    }
}
