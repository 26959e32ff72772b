use thiserror::Error;

/// Core error type for the Millrace engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Workflow definition not found
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Workflow instance not found
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    /// Activity instance not found in the workflow instance
    #[error("Activity instance not found: {0}")]
    ActivityInstanceNotFound(String),

    /// A message targeted an activity instance that has already completed
    #[error("Activity instance already ended: {0}")]
    AlreadyEnded(String),

    /// The instance lock could not be acquired after exhausting retries
    #[error("Could not lock workflow instance: {0}")]
    LockFailed(String),

    /// An activity instance was ended while child instances were still open
    #[error("Activity instance {0} still has open child instances")]
    OpenChildren(String),

    /// Invalid structural state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No activity behavior registered for the given type
    #[error("No behavior registered for activity type: {0}")]
    BehaviorNotFound(String),

    /// Store error
    #[error("Store error: {0}")]
    StoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Engine configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}
