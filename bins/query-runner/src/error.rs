#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("invalid argument '{0}': expected name=value")]
    Argument(String),

    #[error("{0}")]
    Pipeline(#[from] query_pipeline::PipelineError),

    #[error("output: {0}")]
    Io(#[from] std::io::Error),
}
