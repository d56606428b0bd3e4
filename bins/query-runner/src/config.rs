use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use query_api::Endpoint;
use query_pipeline::EngineConfig;

use crate::error::RunnerError;

#[derive(Parser)]
#[command(name = "query-runner", about = "Run pipeline definitions and stream the formatted result")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline and write its output
    Run(RunArgs),
    /// Parse and validate pipeline definitions without running them
    Validate(ValidateArgs),
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Pipeline definition (TOML)
    #[arg(long, short = 'p')]
    pub pipeline: PathBuf,

    /// Deployment config with engine settings and shared endpoints
    #[arg(long, env = "QUERY_RUNNER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Pipeline argument as name=value; repeat for multi-valued arguments
    #[arg(long = "arg", short = 'a')]
    pub arguments: Vec<String>,

    /// Output format by name
    #[arg(long, conflicts_with_all = ["extension", "accept"])]
    pub format: Option<String>,

    /// Output format by file extension
    #[arg(long, conflicts_with = "accept")]
    pub extension: Option<String>,

    /// Output format by Accept header value
    #[arg(long)]
    pub accept: Option<String>,

    /// Write to this file instead of stdout
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
pub struct ValidateArgs {
    /// Pipeline definitions (TOML); repeat to check several
    #[arg(long = "pipeline", short = 'p', required = true)]
    pub pipelines: Vec<PathBuf>,
}

// ---- TOML Config ----

#[derive(Debug, Default, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Endpoints every pipeline can use; a pipeline's own take precedence.
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
}

impl RunnerConfig {
    pub fn load(path: Option<&PathBuf>) -> Result<Self, RunnerError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| RunnerError::Config {
            context: "read",
            detail: format!("'{}': {e}", path.display()),
        })?;
        let config: RunnerConfig = toml::from_str(&content).map_err(|e| RunnerError::Config {
            context: "parse",
            detail: format!("'{}': {e}", path.display()),
        })?;
        if config.engine.source_buffer == 0 {
            return Err(RunnerError::Config { context: "engine", detail: "source_buffer must be positive".into() });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_api::EndpointKind;

    #[test]
    fn parses_engine_and_endpoints() {
        let config: RunnerConfig = toml::from_str(
            r#"
[engine]
source_buffer = 50

[endpoints.warehouse]
type = "sql"
url = "postgres://db/warehouse"
username = "reader"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.source_buffer, 50);
        let warehouse = &config.endpoints["warehouse"];
        assert_eq!(warehouse.kind, EndpointKind::Sql);
        assert_eq!(warehouse.username.as_deref(), Some("reader"));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: RunnerConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.source_buffer, 1000);
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn cli_collects_repeated_arguments() {
        let cli = Cli::parse_from(["query-runner", "run", "--pipeline", "p.toml", "--arg", "a=1", "-a", "a=2", "--format", "csv"]);
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        assert_eq!(args.arguments, vec!["a=1", "a=2"]);
        assert_eq!(args.format.as_deref(), Some("csv"));
    }
}
