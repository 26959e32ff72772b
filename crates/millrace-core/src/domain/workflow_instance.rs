use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::workflow::{
    Activity, ActivityId, OrganizationId, Variable, VariableId, Workflow, WorkflowId,
};
use crate::types::TypedValue;
use crate::EngineError;

/// Value object: workflow instance ID (assigned by the instance store)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowInstanceId(pub String);

/// Value object: activity instance ID, unique and never reused within one
/// workflow instance (monotonic counter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityInstanceId(pub u32);

/// Value object: variable instance ID, unique within one workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableInstanceId(pub u32);

/// The owning scope of an activity or variable instance
///
/// The instance tree is stored as a flat arena inside the workflow instance;
/// parent/child relationships are id lookups, never owning back-pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeId {
    /// The workflow instance's root scope
    Workflow,
    /// The scope of another activity instance
    Activity(ActivityInstanceId),
}

/// Activity-instance state machine state
///
/// `None` in [`ActivityInstance::work_state`] is the terminal marker: the
/// instance has ended and is removed into the archive on the next flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkState {
    /// The activity type's `start` callback must run
    Starting,
    /// Like `Starting`, scoped to one element of a multi-instance collection
    StartingMultiInstance,
    /// A multi-instance container: evaluate the collection and fan out
    StartingMultiContainer,
    /// Waiting for an external message
    Waiting,
    /// The parent scope must be notified of this instance's completion
    Notifying,
}

/// An exclusive, owner-tagged, time-stamped claim on a workflow instance
///
/// Only the owner that acquired the lock may mutate and flush the instance;
/// the core performs no expiry or stealing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceLock {
    /// Acquisition time
    pub time: DateTime<Utc>,
    /// Stable identifier of the owning engine process
    pub owner: String,
}

/// One runtime occurrence of an activity within a workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInstance {
    /// Instance id, assigned from the owning workflow instance's counter
    pub id: ActivityInstanceId,

    /// The activity definition this instance executes
    pub activity_id: ActivityId,

    /// The parent scope instance
    pub parent: ScopeId,

    /// Start timestamp
    pub start: DateTime<Utc>,

    /// End timestamp, set when the instance ends
    pub end: Option<DateTime<Utc>>,

    /// Duration in milliseconds, set together with `end`
    pub duration_millis: Option<i64>,

    /// State-machine state; `None` means ended and ready to archive
    pub work_state: Option<WorkState>,

    /// For call activities: the sub-process instance being awaited
    pub called_workflow_instance_id: Option<WorkflowInstanceId>,
}

impl ActivityInstance {
    /// Whether this instance has reached the terminal marker
    #[inline]
    pub fn is_ended(&self) -> bool {
        self.work_state.is_none()
    }
}

/// The runtime binding of a variable definition to a current value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInstance {
    /// Instance id
    pub id: VariableInstanceId,

    /// The variable definition
    pub variable_id: VariableId,

    /// The owning scope instance
    pub scope: ScopeId,

    /// Current value in the engine's internal representation
    pub value: TypedValue,
}

/// Dirty-tracking flags: which aspects of a workflow instance changed since
/// the last flush
///
/// `flush` writes only the tracked subsets; after a successful flush the
/// store resets tracking via [`InstanceUpdates::reset`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceUpdates {
    /// End timestamp / duration were set
    pub end_changed: bool,
    /// The open activity-instance tree changed (including archival removals)
    pub activity_instances_changed: bool,
    /// The variable-instance set changed
    pub variable_instances_changed: bool,
    /// The synchronous work queue changed
    pub work_changed: bool,
    /// The asynchronous work queue changed
    pub work_async_changed: bool,
    /// The next-id counters advanced
    pub next_ids_changed: bool,
    /// The lock field changed
    pub lock_changed: bool,
}

impl InstanceUpdates {
    /// Whether any aspect is dirty
    pub fn any(&self) -> bool {
        self.end_changed
            || self.activity_instances_changed
            || self.variable_instances_changed
            || self.work_changed
            || self.work_async_changed
            || self.next_ids_changed
            || self.lock_changed
    }

    /// Reset all flags after a successful flush
    pub fn reset(&mut self) {
        *self = InstanceUpdates::default();
    }
}

/// Aggregate: one running execution of a workflow definition
///
/// The root of the runtime instance tree. Mutated only by the party holding
/// its current lock; all mutating operations mark the relevant dirty flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Unique identifier
    pub id: WorkflowInstanceId,

    /// The workflow definition this instance executes
    pub workflow_id: WorkflowId,

    /// Owning organization, copied from the definition
    pub organization_id: Option<OrganizationId>,

    /// Start timestamp
    pub start: DateTime<Utc>,

    /// End timestamp, set exactly once when no work and no open activity
    /// instances remain
    pub end: Option<DateTime<Utc>>,

    /// Duration in milliseconds, set together with `end`
    pub duration_millis: Option<i64>,

    /// Current lock
    pub lock: Option<InstanceLock>,

    /// Synchronous work queue (primary), drained FIFO by the scheduler
    pub work: VecDeque<ActivityInstanceId>,

    /// Deferred work, promoted to the primary queue at async handoff
    pub work_async: VecDeque<ActivityInstanceId>,

    /// Set when the instance has been switched to asynchronous continuation;
    /// from then on all new work goes to the primary queue
    pub switched_async: bool,

    /// Next activity-instance id to assign
    pub next_activity_instance_id: u32,

    /// Next variable-instance id to assign
    pub next_variable_instance_id: u32,

    /// Caller linkage for call-activity sub-processes
    pub caller_workflow_instance_id: Option<WorkflowInstanceId>,

    /// Caller linkage for call-activity sub-processes
    pub caller_activity_instance_id: Option<ActivityInstanceId>,

    /// The open activity-instance arena
    pub activity_instances: HashMap<ActivityInstanceId, ActivityInstance>,

    /// The variable-instance arena
    pub variable_instances: HashMap<VariableInstanceId, VariableInstance>,

    /// Dirty tracking since the last flush
    #[serde(skip)]
    pub updates: InstanceUpdates,
}

impl WorkflowInstance {
    /// Create a new instance of the given definition, already locked by the
    /// creating engine (start creates and locks atomically)
    pub fn new(id: WorkflowInstanceId, workflow: &Workflow, lock: InstanceLock) -> Self {
        Self {
            id,
            workflow_id: workflow.id.clone(),
            organization_id: workflow.organization_id.clone(),
            start: Utc::now(),
            end: None,
            duration_millis: None,
            lock: Some(lock),
            work: VecDeque::new(),
            work_async: VecDeque::new(),
            switched_async: false,
            next_activity_instance_id: 1,
            next_variable_instance_id: 1,
            caller_workflow_instance_id: None,
            caller_activity_instance_id: None,
            activity_instances: HashMap::new(),
            variable_instances: HashMap::new(),
            updates: InstanceUpdates::default(),
        }
    }

    /// Look up an open activity instance
    pub fn activity_instance(&self, id: ActivityInstanceId) -> Option<&ActivityInstance> {
        self.activity_instances.get(&id)
    }

    /// Look up an open activity instance mutably
    pub fn activity_instance_mut(
        &mut self,
        id: ActivityInstanceId,
    ) -> Option<&mut ActivityInstance> {
        self.activity_instances.get_mut(&id)
    }

    /// Whether the given id was ever assigned in this instance
    ///
    /// Ids are monotonic and never reused, so an id below the counter that is
    /// absent from the open tree must have ended and been archived.
    pub fn activity_instance_existed(&self, id: ActivityInstanceId) -> bool {
        id.0 > 0 && id.0 < self.next_activity_instance_id
    }

    /// Create a new activity instance in the given parent scope, initialize
    /// its scope variables, and enqueue it for execution
    pub fn create_activity_instance(
        &mut self,
        parent: ScopeId,
        activity: &Activity,
        work_state: WorkState,
    ) -> ActivityInstanceId {
        let id = ActivityInstanceId(self.next_activity_instance_id);
        self.next_activity_instance_id += 1;
        self.updates.next_ids_changed = true;

        self.activity_instances.insert(
            id,
            ActivityInstance {
                id,
                activity_id: activity.id.clone(),
                parent,
                start: Utc::now(),
                end: None,
                duration_millis: None,
                work_state: Some(work_state),
                called_workflow_instance_id: None,
            },
        );
        self.updates.activity_instances_changed = true;

        self.initialize_scope_variables(ScopeId::Activity(id), &activity.scope.variables);
        self.enqueue(id, activity.asynchronous);
        id
    }

    /// Create variable instances for the declarations of a freshly entered
    /// scope, applying definition initial values
    pub fn initialize_scope_variables(&mut self, scope: ScopeId, variables: &[Variable]) {
        for variable in variables {
            let value = variable
                .initial_value
                .clone()
                .unwrap_or_else(TypedValue::null);
            self.create_variable_instance(scope, variable.id.clone(), value);
        }
    }

    /// Create a variable instance in the given scope
    pub fn create_variable_instance(
        &mut self,
        scope: ScopeId,
        variable_id: VariableId,
        value: TypedValue,
    ) -> VariableInstanceId {
        let id = VariableInstanceId(self.next_variable_instance_id);
        self.next_variable_instance_id += 1;
        self.updates.next_ids_changed = true;

        self.variable_instances.insert(
            id,
            VariableInstance {
                id,
                variable_id,
                scope,
                value,
            },
        );
        self.updates.variable_instances_changed = true;
        id
    }

    /// Set a variable value, walking up from the given scope to the scope
    /// that declares it; an undeclared variable is bound at the given scope
    pub fn set_variable(&mut self, scope: ScopeId, variable_id: &VariableId, value: TypedValue) {
        let mut current = Some(scope);
        while let Some(s) = current {
            let found = self
                .variable_instances
                .iter()
                .find(|(_, v)| v.scope == s && &v.variable_id == variable_id)
                .map(|(id, _)| *id);
            if let Some(id) = found {
                if let Some(instance) = self.variable_instances.get_mut(&id) {
                    instance.value = value;
                    self.updates.variable_instances_changed = true;
                }
                return;
            }
            current = self.parent_scope(s);
        }
        self.create_variable_instance(scope, variable_id.clone(), value);
    }

    /// Read a variable value, walking up from the given scope to the root
    pub fn variable_value(&self, scope: ScopeId, variable_id: &VariableId) -> Option<&TypedValue> {
        let mut current = Some(scope);
        while let Some(s) = current {
            let found = self
                .variable_instances
                .values()
                .find(|v| v.scope == s && &v.variable_id == variable_id);
            if let Some(instance) = found {
                return Some(&instance.value);
            }
            current = self.parent_scope(s);
        }
        None
    }

    fn parent_scope(&self, scope: ScopeId) -> Option<ScopeId> {
        match scope {
            ScopeId::Workflow => None,
            ScopeId::Activity(id) => self.activity_instances.get(&id).map(|a| a.parent),
        }
    }

    /// Enqueue a state-machine step for an activity instance
    ///
    /// Work for an asynchronous activity is deferred to the asynchronous
    /// queue, unless the instance has already switched to asynchronous mode,
    /// in which case everything goes to the primary queue.
    pub fn enqueue(&mut self, id: ActivityInstanceId, asynchronous: bool) {
        if asynchronous && !self.switched_async {
            self.work_async.push_back(id);
            self.updates.work_async_changed = true;
        } else {
            self.work.push_back(id);
            self.updates.work_changed = true;
        }
    }

    /// Pop the next pending item from the primary queue
    pub fn next_work(&mut self) -> Option<ActivityInstanceId> {
        let next = self.work.pop_front();
        if next.is_some() {
            self.updates.work_changed = true;
        }
        next
    }

    /// Promote the asynchronous queue to the primary queue for continuation
    /// in a separate execution context
    pub fn switch_to_async(&mut self) {
        self.work = std::mem::take(&mut self.work_async);
        self.switched_async = true;
        self.updates.work_changed = true;
        self.updates.work_async_changed = true;
    }

    /// Open children of an activity instance
    pub fn open_children(&self, parent: ActivityInstanceId) -> Vec<&ActivityInstance> {
        self.activity_instances
            .values()
            .filter(|a| a.parent == ScopeId::Activity(parent) && !a.is_ended())
            .collect()
    }

    /// Whether any open (non-ended) activity instances remain anywhere
    pub fn has_open_activity_instances(&self) -> bool {
        self.activity_instances.values().any(|a| !a.is_ended())
    }

    /// End an activity instance
    ///
    /// Requires zero open child instances. With `notify_parent`, the state
    /// becomes [`WorkState::Notifying`] and the instance is re-enqueued on
    /// the primary queue; otherwise the work state is cleared to the
    /// terminal marker directly.
    pub fn end_activity_instance(
        &mut self,
        id: ActivityInstanceId,
        notify_parent: bool,
    ) -> Result<(), EngineError> {
        if !self.open_children(id).is_empty() {
            return Err(EngineError::OpenChildren(id.0.to_string()));
        }
        let instance = self
            .activity_instances
            .get_mut(&id)
            .ok_or_else(|| EngineError::ActivityInstanceNotFound(id.0.to_string()))?;
        if instance.is_ended() {
            return Err(EngineError::AlreadyEnded(id.0.to_string()));
        }

        let now = Utc::now();
        instance.end = Some(now);
        instance.duration_millis = Some((now - instance.start).num_milliseconds());
        if notify_parent {
            instance.work_state = Some(WorkState::Notifying);
        } else {
            instance.work_state = None;
        }
        self.updates.activity_instances_changed = true;

        if notify_parent {
            // Parent notification stays on the primary queue regardless of
            // the activity's asynchronous flag.
            self.work.push_back(id);
            self.updates.work_changed = true;
        }
        Ok(())
    }

    /// Replace the work state of an open activity instance
    pub fn set_work_state(&mut self, id: ActivityInstanceId, state: WorkState) {
        if let Some(instance) = self.activity_instances.get_mut(&id) {
            instance.work_state = Some(state);
            self.updates.activity_instances_changed = true;
        }
    }

    /// Clear the work state to the terminal marker
    pub fn clear_work_state(&mut self, id: ActivityInstanceId) {
        if let Some(instance) = self.activity_instances.get_mut(&id) {
            instance.work_state = None;
            self.updates.activity_instances_changed = true;
        }
    }

    /// End the workflow instance. Idempotent: the end timestamp is set
    /// exactly once.
    pub fn end(&mut self) {
        if self.end.is_none() {
            let now = Utc::now();
            self.end = Some(now);
            self.duration_millis = Some((now - self.start).num_milliseconds());
            self.updates.end_changed = true;
        }
    }

    /// Remove the lock, marking the aspect dirty so the flush clears it in
    /// the store as well
    pub fn remove_lock(&mut self) {
        self.lock = None;
        self.updates.lock_changed = true;
    }

    /// Partition the instance tree for a flush pass: ended activity
    /// instances are removed from the live arena (together with the variable
    /// instances scoped to them) and returned for appending to the store's
    /// archive.
    pub fn take_ended(&mut self) -> Vec<ActivityInstance> {
        let ended_ids: Vec<ActivityInstanceId> = self
            .activity_instances
            .iter()
            .filter(|(_, a)| a.is_ended())
            .map(|(id, _)| *id)
            .collect();
        if ended_ids.is_empty() {
            return Vec::new();
        }

        let before = self.variable_instances.len();
        self.variable_instances.retain(|_, v| match v.scope {
            ScopeId::Activity(owner) => !ended_ids.contains(&owner),
            ScopeId::Workflow => true,
        });
        if self.variable_instances.len() != before {
            self.updates.variable_instances_changed = true;
        }

        self.updates.activity_instances_changed = true;
        ended_ids
            .into_iter()
            .filter_map(|id| self.activity_instances.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::workflow::Activity;
    use serde_json::json;

    fn locked_instance() -> WorkflowInstance {
        let workflow = Workflow::new("wf1");
        WorkflowInstance::new(
            WorkflowInstanceId("i1".to_string()),
            &workflow,
            InstanceLock {
                time: Utc::now(),
                owner: "engine-test".to_string(),
            },
        )
    }

    #[test]
    fn test_activity_instance_ids_are_monotonic() {
        let mut instance = locked_instance();
        let activity = Activity::new("a", "task");

        let first = instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);
        let second =
            instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);

        assert_eq!(first.0, 1);
        assert_eq!(second.0, 2);
        assert_eq!(instance.next_activity_instance_id, 3);
        assert!(instance.updates.next_ids_changed);
        assert!(instance.activity_instance_existed(first));
        assert!(!instance.activity_instance_existed(ActivityInstanceId(99)));
    }

    #[test]
    fn test_enqueue_routing() {
        let mut instance = locked_instance();
        let sync_activity = Activity::new("s", "task");
        let async_activity = Activity::new("a", "task").asynchronous();

        instance.create_activity_instance(ScopeId::Workflow, &sync_activity, WorkState::Starting);
        instance.create_activity_instance(ScopeId::Workflow, &async_activity, WorkState::Starting);

        assert_eq!(instance.work.len(), 1);
        assert_eq!(instance.work_async.len(), 1);

        // Once switched to async mode, everything goes to the primary queue
        instance.switch_to_async();
        assert_eq!(instance.work.len(), 1);
        assert!(instance.work_async.is_empty());

        instance.create_activity_instance(ScopeId::Workflow, &async_activity, WorkState::Starting);
        assert_eq!(instance.work.len(), 2);
        assert!(instance.work_async.is_empty());
    }

    #[test]
    fn test_end_with_open_children_is_an_error() {
        let mut instance = locked_instance();
        let parent_def = Activity::new("p", "subprocess");
        let child_def = Activity::new("c", "task");

        let parent =
            instance.create_activity_instance(ScopeId::Workflow, &parent_def, WorkState::Starting);
        let child = instance.create_activity_instance(
            ScopeId::Activity(parent),
            &child_def,
            WorkState::Starting,
        );

        let result = instance.end_activity_instance(parent, true);
        assert_eq!(result, Err(EngineError::OpenChildren("1".to_string())));

        instance.end_activity_instance(child, false).unwrap();
        assert!(instance.end_activity_instance(parent, false).is_ok());
    }

    #[test]
    fn test_end_notify_parent_reenqueues() {
        let mut instance = locked_instance();
        let activity = Activity::new("a", "task");
        let id = instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);

        // Drain the queue entry from creation
        assert_eq!(instance.next_work(), Some(id));

        instance.end_activity_instance(id, true).unwrap();
        let ai = instance.activity_instance(id).unwrap();
        assert_eq!(ai.work_state, Some(WorkState::Notifying));
        assert!(ai.end.is_some());
        assert_eq!(instance.next_work(), Some(id));

        // Ending twice is an error
        assert_eq!(
            instance.end_activity_instance(id, false),
            Err(EngineError::AlreadyEnded("1".to_string()))
        );
    }

    #[test]
    fn test_instance_end_is_set_once() {
        let mut instance = locked_instance();
        instance.end();
        let first = instance.end;
        assert!(first.is_some());
        assert!(instance.updates.end_changed);

        instance.updates.reset();
        instance.end();
        assert_eq!(instance.end, first);
        assert!(!instance.updates.end_changed);
    }

    #[test]
    fn test_variable_scope_fallback() {
        let mut instance = locked_instance();
        let activity = Activity::new("a", "task");
        let id = instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);

        let amount = VariableId("amount".to_string());
        instance.create_variable_instance(
            ScopeId::Workflow,
            amount.clone(),
            TypedValue::new(json!(1)),
        );

        // Reads from a nested scope fall back to the root declaration
        let seen = instance
            .variable_value(ScopeId::Activity(id), &amount)
            .unwrap();
        assert_eq!(seen.as_value(), &json!(1));

        // Writes from a nested scope update the declaring scope
        instance.set_variable(ScopeId::Activity(id), &amount, TypedValue::new(json!(2)));
        let seen = instance.variable_value(ScopeId::Workflow, &amount).unwrap();
        assert_eq!(seen.as_value(), &json!(2));
        assert_eq!(instance.variable_instances.len(), 1);

        // An undeclared variable is bound at the requested scope
        let local = VariableId("local".to_string());
        instance.set_variable(ScopeId::Activity(id), &local, TypedValue::new(json!(3)));
        assert!(instance.variable_value(ScopeId::Workflow, &local).is_none());
        assert!(instance
            .variable_value(ScopeId::Activity(id), &local)
            .is_some());
    }

    #[test]
    fn test_take_ended_partitions_tree_and_variables() {
        let mut instance = locked_instance();
        let mut activity = Activity::new("a", "task");
        activity.scope.variables.push(Variable::new(
            "scratch",
            crate::types::DataType::Json,
        ));

        let open = instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);
        let done = instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);
        instance.end_activity_instance(done, false).unwrap();
        instance.updates.reset();

        let ended = instance.take_ended();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].id, done);
        assert!(instance.activity_instance(done).is_none());
        assert!(instance.activity_instance(open).is_some());
        assert!(instance.updates.activity_instances_changed);

        // The ended scope's variable instance is gone, the open one remains
        assert_eq!(instance.variable_instances.len(), 1);
        assert!(instance.updates.variable_instances_changed);

        // Nothing left to partition
        instance.updates.reset();
        assert!(instance.take_ended().is_empty());
        assert!(!instance.updates.any());
    }

    #[test]
    fn test_instance_serialization_skips_updates() {
        let mut instance = locked_instance();
        let activity = Activity::new("a", "task");
        instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);

        let serialized = serde_json::to_string(&instance).unwrap();
        let deserialized: WorkflowInstance = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.id, instance.id);
        assert_eq!(deserialized.activity_instances.len(), 1);
        assert_eq!(deserialized.work.len(), 1);
        assert!(!deserialized.updates.any());
    }
}
