//! Errors raised by stages and stacks

use thiserror::Error;

/// Errors a stage reports from one of its entry points
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The stage was handed an outgoing message it never originates
    #[error("{stage} does not accept outgoing {kind} messages")]
    UnsupportedOutgoing { stage: String, kind: String },

    #[error("{stage} received a message before it was started")]
    NotStarted { stage: String },
}

/// Errors that can occur in protocol stack operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Protocol stack has not been started")]
    NotStarted,

    #[error("Protocol stack was already started")]
    AlreadyStarted,

    #[error("Protocol stack is stopped")]
    Stopped,

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },
}

impl PipelineError {
    /// The stage error underneath, if a stage raised this
    pub fn stage_error(&self) -> Option<&StageError> {
        match self {
            PipelineError::Stage { source, .. } => Some(source),
            _ => None,
        }
    }
}
