use thiserror::Error;

/// Core error type for the Goalflow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A goal or dependency references a step that is not registered
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// A step with the same ID is already registered
    #[error("Step already exists: {0}")]
    StepExists(String),

    /// Required-attribute edges form a cycle
    #[error("Cyclic dependency: {0}")]
    CyclicDependency(String),

    /// Malformed catalog entry
    #[error("Invalid step definition: {0}")]
    InvalidStepDefinition(String),

    /// Plan requested without any goals
    #[error("At least one goal step is required")]
    NoGoals,

    /// Flow start is missing externally supplied inputs
    #[error("Required inputs not provided: {0}")]
    MissingRequiredInputs(String),

    /// Flow not found
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// A flow with the same ID is already running or retained
    #[error("Flow already exists: {0}")]
    FlowExists(String),

    /// No execution for the step in this flow
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Result carries a superseded or unknown token
    #[error("Stale token: {0}")]
    StaleToken(String),

    /// Flow already reached a terminal state
    #[error("Flow is terminal: {0}")]
    FlowTerminal(String),

    /// Step invocation could not be delivered or answered
    #[error("Transport error: {0}")]
    Transport(String),

    /// Step invocation exceeded its timeout
    #[error("Step timed out: {0}")]
    Timeout(String),

    /// Script or predicate evaluation failure
    #[error("Script error: {0}")]
    Script(String),

    /// Attribute mapping failure
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Sub-flow nesting exceeded the configured depth
    #[error("Sub-flow recursion limit reached: {0}")]
    RecursionLimit(String),

    /// Snapshot store error
    #[error("Snapshot store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Errors caused by the caller's request rather than the engine
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::UnknownStep(_)
                | CoreError::StepExists(_)
                | CoreError::CyclicDependency(_)
                | CoreError::InvalidStepDefinition(_)
                | CoreError::NoGoals
                | CoreError::MissingRequiredInputs(_)
                | CoreError::FlowNotFound(_)
                | CoreError::FlowExists(_)
                | CoreError::ExecutionNotFound(_)
                | CoreError::StaleToken(_)
                | CoreError::FlowTerminal(_)
        )
    }

    /// Late or duplicate signals that are dropped without affecting the flow
    pub fn is_stale(&self) -> bool {
        matches!(self, CoreError::StaleToken(_) | CoreError::FlowTerminal(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::UnknownStep("a".to_string()), "Unknown step: a"),
            (CoreError::CyclicDependency("a -> b -> a".to_string()), "Cyclic dependency: a -> b -> a"),
            (CoreError::NoGoals, "At least one goal step is required"),
            (CoreError::MissingRequiredInputs("x, y".to_string()), "Required inputs not provided: x, y"),
            (CoreError::StaleToken("t1".to_string()), "Stale token: t1"),
            (CoreError::Timeout("5000ms".to_string()), "Step timed out: 5000ms"),
            (CoreError::Other("other_err".to_string()), "other_err"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_client_error_classification() {
        assert!(CoreError::CyclicDependency("a".into()).is_client_error());
        assert!(CoreError::FlowNotFound("f".into()).is_client_error());
        assert!(!CoreError::Store("down".into()).is_client_error());
        assert!(!CoreError::Transport("refused".into()).is_client_error());
    }

    #[test]
    fn test_stale_classification() {
        assert!(CoreError::StaleToken("t".into()).is_stale());
        assert!(CoreError::FlowTerminal("f".into()).is_stale());
        assert!(!CoreError::ExecutionNotFound("s".into()).is_stale());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::Serialization(msg) => {
                assert!(msg.contains("expected value"));
            }
            _ => panic!("Expected Serialization variant"),
        }
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "test error message".into();
        assert_eq!(error, CoreError::Other("test error message".to_string()));
    }
}
