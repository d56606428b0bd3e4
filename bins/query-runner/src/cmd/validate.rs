use query_pipeline::PipelineDefinition;

use crate::config::ValidateArgs;
use crate::error::RunnerError;

/// Validate every file, reporting each; fails if any is invalid.
pub fn run(args: ValidateArgs) -> Result<(), RunnerError> {
    let mut first_error = None;
    for path in &args.pipelines {
        match PipelineDefinition::load(path) {
            Ok(definition) => tracing::info!(
                pipeline = %path.display(),
                source = definition.source.kind(),
                processors = definition.processors.len(),
                formats = definition.formats.len(),
                "definition is valid"
            ),
            Err(e) => {
                tracing::error!(pipeline = %path.display(), error = %e, "invalid definition");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
