use query_api::{ErrorKind, StreamError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("definition error ({context}): {detail}")]
    Definition { context: String, detail: String },

    #[error("argument \"{name}\": {reason}")]
    Argument { name: String, reason: String },

    #[error("format: {0}")]
    Format(String),

    #[error("pipeline already ran")]
    AlreadyRan,

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn definition(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Definition { context: context.into(), detail: detail.into() }
    }

    pub fn argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Argument { name: name.into(), reason: reason.into() }
    }

    /// Add context to the error.
    ///
    /// Stream errors keep their kind; definition errors extend the context.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            PipelineError::Stream(e) => PipelineError::Stream(e.with_context(ctx)),
            PipelineError::Definition { context, detail } => {
                PipelineError::Definition { context: format!("{ctx}: {context}"), detail }
            }
            other => other,
        }
    }

    /// HTTP-style status: 400 when the request or definition is at fault,
    /// 500 for backend failures.
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::Definition { .. } | PipelineError::Argument { .. } | PipelineError::Format(_) => 400,
            PipelineError::Stream(e) if e.kind() == ErrorKind::Config => 400,
            _ => 500,
        }
    }
}
