//! Store contract tests: locking, partial flush, and the archive

use std::sync::Arc;

use pretty_assertions::assert_eq;

use millrace_core::domain::repository::{InstanceQuery, LockQuery, WorkflowInstanceStore};
use millrace_core::{
    Activity, EngineError, InstanceLock, ScopeId, TypedValue, VariableId, WorkState, Workflow,
    WorkflowInstance, WorkflowInstanceId,
};
use millrace_state_inmemory::InMemoryWorkflowInstanceStore;

fn sample_workflow() -> Workflow {
    let mut workflow = Workflow::new("wf1").with_name("sample");
    workflow.scope.activities.push(Activity::new("a", "task"));
    workflow
}

async fn inserted_instance(
    store: &InMemoryWorkflowInstanceStore,
    owner: &str,
) -> WorkflowInstance {
    let workflow = sample_workflow();
    let id = store.generate_workflow_instance_id().await;
    let mut instance = WorkflowInstance::new(
        id,
        &workflow,
        InstanceLock {
            time: chrono::Utc::now(),
            owner: owner.to_string(),
        },
    );
    store.insert_workflow_instance(&mut instance).await.unwrap();
    instance
}

#[tokio::test]
async fn test_lock_is_mutually_exclusive() {
    let store = InMemoryWorkflowInstanceStore::new();
    let mut instance = inserted_instance(&store, "engine-a").await;

    // Created locked; a second owner cannot acquire it
    let contended = store
        .lock_workflow_instance(&LockQuery::new(instance.id.clone(), "engine-b"))
        .await
        .unwrap();
    assert!(contended.is_none());

    // After unlock the lock is acquirable again
    store
        .flush_and_unlock(&mut instance)
        .await
        .unwrap();
    let acquired = store
        .lock_workflow_instance(&LockQuery::new(instance.id.clone(), "engine-b"))
        .await
        .unwrap()
        .expect("lock should be free");
    assert_eq!(acquired.lock.as_ref().unwrap().owner, "engine-b");

    // And held again
    let contended = store
        .lock_workflow_instance(&LockQuery::new(instance.id.clone(), "engine-a"))
        .await
        .unwrap();
    assert!(contended.is_none());
}

#[tokio::test]
async fn test_lock_unknown_instance_is_an_error() {
    let store = InMemoryWorkflowInstanceStore::new();
    let result = store
        .lock_workflow_instance(&LockQuery::new(
            WorkflowInstanceId("missing".to_string()),
            "engine-a",
        ))
        .await;
    assert_eq!(
        result,
        Err(EngineError::InstanceNotFound("missing".to_string()))
    );
}

#[tokio::test]
async fn test_flush_writes_only_dirty_aspects() {
    let store = InMemoryWorkflowInstanceStore::new();
    let mut instance = inserted_instance(&store, "engine-a").await;

    // Only a variable changed
    instance.set_variable(
        ScopeId::Workflow,
        &VariableId("amount".to_string()),
        TypedValue::new(serde_json::json!(42)),
    );
    store.flush(&mut instance).await.unwrap();
    assert_eq!(
        store.flushed_aspects(&instance.id).await.unwrap(),
        vec!["variableInstances", "nextIds"]
    );

    // Nothing dirty: the flush is a no-op
    store.flush(&mut instance).await.unwrap();
    assert!(store.flushed_aspects(&instance.id).await.unwrap().is_empty());

    // The written value is visible on the stored image
    let found = store
        .find_workflow_instances(&InstanceQuery::by_id(instance.id.clone()))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let value = found[0]
        .variable_value(ScopeId::Workflow, &VariableId("amount".to_string()))
        .cloned()
        .unwrap();
    assert_eq!(value.as_value(), &serde_json::json!(42));
}

#[tokio::test]
async fn test_archive_is_append_only_and_exactly_once() {
    let store = InMemoryWorkflowInstanceStore::new();
    let mut instance = inserted_instance(&store, "engine-a").await;
    let activity = Activity::new("a", "task");

    let done =
        instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);
    let open =
        instance.create_activity_instance(ScopeId::Workflow, &activity, WorkState::Starting);
    instance.end_activity_instance(done, false).unwrap();
    store.flush(&mut instance).await.unwrap();

    let archived = store.archived_activity_instances(&instance.id).await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, done);

    // The ended instance left the open tree for good
    let found = store
        .find_workflow_instances(&InstanceQuery::by_id(instance.id.clone()))
        .await
        .unwrap();
    assert!(found[0].activity_instance(done).is_none());
    assert!(found[0].activity_instance(open).is_some());

    // Further flushes never duplicate the archive entry
    instance.end_activity_instance(open, false).unwrap();
    store.flush(&mut instance).await.unwrap();
    store.flush(&mut instance).await.unwrap();
    let archived = store.archived_activity_instances(&instance.id).await.unwrap();
    assert_eq!(archived.len(), 2);
}

#[tokio::test]
async fn test_unlock_discards_no_state() {
    let store = InMemoryWorkflowInstanceStore::new();
    let mut instance = inserted_instance(&store, "engine-a").await;

    // In-memory mutation that is never flushed
    instance.set_variable(
        ScopeId::Workflow,
        &VariableId("scratch".to_string()),
        TypedValue::new(serde_json::json!(1)),
    );
    store.unlock(&instance.id).await.unwrap();

    let found = store
        .find_workflow_instances(&InstanceQuery::by_id(instance.id.clone()))
        .await
        .unwrap();
    assert!(found[0].lock.is_none());
    assert!(found[0]
        .variable_value(ScopeId::Workflow, &VariableId("scratch".to_string()))
        .is_none());
}

#[tokio::test]
async fn test_delete_by_query() {
    let store = InMemoryWorkflowInstanceStore::new();
    let first = inserted_instance(&store, "engine-a").await;
    let second = inserted_instance(&store, "engine-a").await;

    let deleted = store
        .delete_workflow_instances(&InstanceQuery::by_id(first.id.clone()))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let remaining = store
        .find_workflow_instances(&InstanceQuery::default())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, second.id);
}

mod engine_embedding {
    use super::*;
    use pretty_assertions::assert_eq;
    use millrace_core::{
        EndEventBehavior, StartEventBehavior, StartParams, Transition, WorkflowEngineBuilder,
        WorkflowId,
    };
    use millrace_state_inmemory::InMemoryWorkflowStore;

    fn two_activity_workflow() -> Workflow {
        let mut workflow = Workflow::new("two-step").with_name("two-step");
        workflow.scope.activities.push(Activity::new("start", "startEvent"));
        workflow.scope.activities.push(Activity::new("end", "endEvent"));
        workflow
            .scope
            .transitions
            .push(Transition::new("t1", "start", "end"));
        workflow
    }

    #[tokio::test]
    async fn test_engine_runs_on_these_stores() {
        let instance_store = Arc::new(InMemoryWorkflowInstanceStore::new());
        let engine = WorkflowEngineBuilder::new()
            .workflow_store(Arc::new(InMemoryWorkflowStore::new()))
            .instance_store(instance_store.clone())
            .behavior("startEvent", Arc::new(StartEventBehavior))
            .behavior("endEvent", Arc::new(EndEventBehavior))
            .build()
            .unwrap();

        engine.deploy(two_activity_workflow()).await.unwrap();
        let id = engine
            .start_by_id(&WorkflowId("two-step".to_string()), StartParams::new())
            .await
            .unwrap();

        let found = engine
            .find_workflow_instances(&InstanceQuery::by_id(id.clone()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].end.is_some());
        assert!(found[0].lock.is_none());
        assert!(!found[0].has_open_activity_instances());

        let archived = instance_store.archived_activity_instances(&id).await.unwrap();
        assert_eq!(archived.len(), 2);
    }
}
