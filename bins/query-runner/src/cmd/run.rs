use std::sync::Arc;

use tokio::io::AsyncWrite;

use query_api::Arguments;
use query_pipeline::{Catalog, Composer, FormatRequest, PipelineDefinition, RunRequest, TracingAuditor};

use crate::config::{RunArgs, RunnerConfig};
use crate::error::RunnerError;

pub async fn run(args: RunArgs) -> Result<(), RunnerError> {
    let config = RunnerConfig::load(args.config.as_ref())?;
    if let Some(path) = &args.config {
        tracing::info!(config = %path.display(), endpoints = config.endpoints.len(), "loaded config");
    }

    let definition = Arc::new(PipelineDefinition::load(&args.pipeline)?);
    let pipeline = args
        .pipeline
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pipeline".into());

    let request = RunRequest {
        pipeline: pipeline.clone(),
        arguments: parse_arguments(&args.arguments)?,
        format: format_request(&args),
    };

    let composer = Composer::new(Catalog::new(), Arc::new(TracingAuditor), config.engine)
        .with_endpoints(config.endpoints);
    let instance = composer.prepare(definition, request)?;
    tracing::info!(
        pipeline = %pipeline,
        run_id = %instance.run_id(),
        content_type = %instance.content_type(),
        "running pipeline"
    );

    let output: Box<dyn AsyncWrite + Unpin + Send> = match &args.output {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };
    let summary = instance.run(output).await?;
    tracing::info!(rows = summary.rows, dropped = summary.dropped, "done");
    Ok(())
}

fn format_request(args: &RunArgs) -> FormatRequest {
    if let Some(name) = &args.format {
        FormatRequest::by_name(name.as_str())
    } else if let Some(extension) = &args.extension {
        FormatRequest::by_extension(extension.as_str())
    } else if let Some(accept) = &args.accept {
        FormatRequest::by_accept(accept.as_str())
    } else {
        FormatRequest::default()
    }
}

/// `name=value` pairs; a repeated name collects every value.
fn parse_arguments(raw: &[String]) -> Result<Arguments, RunnerError> {
    let mut arguments = Arguments::new();
    for pair in raw {
        let (name, value) = pair
            .split_once('=')
            .filter(|(name, _)| !name.trim().is_empty())
            .ok_or_else(|| RunnerError::Argument(pair.clone()))?;
        arguments.push(name.trim(), value);
    }
    Ok(arguments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_names_collect_values() {
        let raw = vec!["region=eu".to_string(), "region=us".into(), "q=a=b".into()];
        let arguments = parse_arguments(&raw).unwrap();
        assert_eq!(arguments.get("region"), ["eu", "us"]);
        assert_eq!(arguments.first("q"), Some("a=b"));
    }

    #[test]
    fn pair_without_name_is_rejected() {
        let err = parse_arguments(&["=x".to_string()]).unwrap_err();
        assert!(matches!(err, RunnerError::Argument(_)));
        assert!(parse_arguments(&["plain".to_string()]).is_err());
    }
}
