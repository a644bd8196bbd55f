use crate::state::StageState;
use thiserror::Error;

/// Result type for pipeline stage operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors returned by stage operations, queues and the registry
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A precondition on the arguments failed
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// The handle does not refer to a registered stage
    #[error("Invalid object: stage is not registered")]
    InvalidObject,

    /// The operation is not legal from the current state
    #[error("Invalid state transition: cannot {op} a stage in state {from:?}")]
    InvalidStateTransition { from: StageState, op: &'static str },

    /// The caller does not own the resource it tried to operate on
    #[error("Not owner")]
    NotOwner,

    /// A stage with the same name is already registered
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Nothing is registered under the given name
    #[error("Not found: {0}")]
    NotFound(String),

    /// An allocation could not be satisfied
    #[error("No memory")]
    NoMemory,

    /// The operation did not complete before its deadline
    #[error("Timed out")]
    TimedOut,

    /// The operating system refused a request
    #[error("OS error: {0}")]
    Os(#[from] std::io::Error),

    /// A blocked call was woken without real data
    #[error("Wakeup requested")]
    WakeupRequested,

    /// The stage has no live workers to carry out the request
    #[error("Not operational")]
    NotOperational,

    /// A worker thread panicked inside a hook
    #[error("Worker thread {0} panicked")]
    ThreadPanicked(usize),

    /// Any other failure
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    pub(crate) fn transition(from: StageState, op: &'static str) -> Self {
        PipelineError::InvalidStateTransition { from, op }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TimedOut | PipelineError::WakeupRequested)
    }
}
