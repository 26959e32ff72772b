use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::workflow::Transition;
use crate::domain::workflow_instance::{ActivityInstance, WorkflowInstance};

/// Observer for workflow instance lifecycle events
///
/// Listeners run inline on the executing task, while the instance lock is
/// held, so implementations should return quickly. They cannot influence
/// control flow; all methods default to no-ops.
#[async_trait]
pub trait WorkflowInstanceEventListener: Send + Sync {
    /// An activity instance is about to run its start callback
    async fn activity_instance_started(
        &self,
        instance: &WorkflowInstance,
        activity_instance: &ActivityInstance,
    ) {
        let _ = (instance, activity_instance);
    }

    /// An activity instance reached its end
    async fn activity_instance_ended(
        &self,
        instance: &WorkflowInstance,
        activity_instance: &ActivityInstance,
    ) {
        let _ = (instance, activity_instance);
    }

    /// An outgoing transition is being taken
    async fn transition_taken(&self, instance: &WorkflowInstance, transition: &Transition) {
        let _ = (instance, transition);
    }

    /// A workflow instance reached its end
    async fn workflow_instance_ended(&self, instance: &WorkflowInstance) {
        let _ = instance;
    }
}

/// An immutable snapshot of registered listeners, cheap to clone into
/// spawned continuations
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Arc<[Arc<dyn WorkflowInstanceEventListener>]>,
}

impl ListenerSet {
    /// Snapshot the given listeners
    pub fn new(listeners: Vec<Arc<dyn WorkflowInstanceEventListener>>) -> Self {
        Self {
            listeners: listeners.into(),
        }
    }

    /// Whether any listeners are registered
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Notify all listeners of a starting activity instance
    pub async fn activity_instance_started(
        &self,
        instance: &WorkflowInstance,
        activity_instance: &ActivityInstance,
    ) {
        for listener in self.listeners.iter() {
            listener
                .activity_instance_started(instance, activity_instance)
                .await;
        }
    }

    /// Notify all listeners of an ended activity instance
    pub async fn activity_instance_ended(
        &self,
        instance: &WorkflowInstance,
        activity_instance: &ActivityInstance,
    ) {
        for listener in self.listeners.iter() {
            listener
                .activity_instance_ended(instance, activity_instance)
                .await;
        }
    }

    /// Notify all listeners of a taken transition
    pub async fn transition_taken(&self, instance: &WorkflowInstance, transition: &Transition) {
        for listener in self.listeners.iter() {
            listener.transition_taken(instance, transition).await;
        }
    }

    /// Notify all listeners of an ended workflow instance
    pub async fn workflow_instance_ended(&self, instance: &WorkflowInstance) {
        for listener in self.listeners.iter() {
            listener.workflow_instance_ended(instance).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::workflow::Workflow;
    use crate::domain::workflow_instance::{InstanceLock, WorkflowInstanceId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        workflow_ends: AtomicUsize,
    }

    #[async_trait]
    impl WorkflowInstanceEventListener for CountingListener {
        async fn workflow_instance_ended(&self, _instance: &WorkflowInstance) {
            self.workflow_ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_listener_set_dispatch() {
        let listener = Arc::new(CountingListener::default());
        let set = ListenerSet::new(vec![listener.clone()]);
        assert!(!set.is_empty());
        assert!(ListenerSet::default().is_empty());

        let workflow = Workflow::new("wf1");
        let instance = WorkflowInstance::new(
            WorkflowInstanceId("i1".to_string()),
            &workflow,
            InstanceLock {
                time: chrono::Utc::now(),
                owner: "engine-test".to_string(),
            },
        );

        set.workflow_instance_ended(&instance).await;
        set.workflow_instance_ended(&instance).await;
        assert_eq!(listener.workflow_ends.load(Ordering::SeqCst), 2);
    }
}
