pub mod arguments;
pub mod audit;
pub mod catalog;
pub mod composer;
pub mod config;
pub mod error;
pub mod format_select;
mod graph;
mod preprocess;

pub use arguments::prepare_arguments;
pub use audit::{AuditRecord, MemoryAuditor, TracingAuditor};
pub use catalog::Catalog;
pub use composer::{Composer, PipelineInstance, PipelineState, RunRequest, RunSummary};
pub use config::{EngineConfig, PipelineDefinition};
pub use error::PipelineError;
pub use format_select::{FormatRequest, select_format};
