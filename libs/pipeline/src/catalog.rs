use std::sync::Arc;

use query_api::{RowEncoder, ScriptEngine};
use query_format_delimited::DelimitedEncoder;
use query_format_html::HtmlEncoder;
use query_format_json::JsonEncoder;
use query_format_spreadsheet::SpreadsheetEncoder;
use query_format_xml::XmlEncoder;
use query_processor_limit::LimitProcessor;
use query_processor_offset::OffsetProcessor;
use query_processor_relabel::RelabelProcessor;
use query_processor_script::{RhaiEngine, ScriptProcessor};
use query_processor_sort::SortProcessor;
use query_source_sql::{SqlDriver, SqlSource};
use query_source_static::StaticSource;
use query_source_test::TestSource;
use query_stream::{Processor, Source};

use crate::config::{FormatDefinition, FormatKind, ProcessorDefinition, ProcessorKind, SourceDefinition};
use crate::error::PipelineError;

/// Turns definitions into live sources, processors and encoders, and holds
/// the collaborators they need.
pub struct Catalog {
    sql_driver: Option<Arc<dyn SqlDriver>>,
    script_engine: Arc<dyn ScriptEngine>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self { sql_driver: None, script_engine: Arc::new(RhaiEngine::new()) }
    }

    pub fn with_sql_driver(mut self, driver: Arc<dyn SqlDriver>) -> Self {
        self.sql_driver = Some(driver);
        self
    }

    pub fn with_script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.script_engine = engine;
        self
    }

    pub fn script_engine(&self) -> &Arc<dyn ScriptEngine> {
        &self.script_engine
    }

    pub fn source(&self, definition: &SourceDefinition) -> Result<Box<dyn Source>, PipelineError> {
        Ok(match definition {
            SourceDefinition::Sql(config) => {
                let driver = self.sql_driver.clone().ok_or_else(|| {
                    PipelineError::definition(format!("sql source [{}]", config.name), "no sql driver is configured")
                })?;
                Box::new(SqlSource::new(config.clone(), driver))
            }
            SourceDefinition::Static(config) => Box::new(StaticSource::new(config.clone())),
            SourceDefinition::Test(config) => Box::new(TestSource::new(config.clone())),
        })
    }

    /// `index` is the 1-based position, used to name unnamed processors.
    pub fn processor(&self, index: usize, definition: &ProcessorDefinition) -> Box<dyn Processor> {
        let name = definition
            .name
            .clone()
            .unwrap_or_else(|| format!("{}[{index}]", definition.kind.name()));
        match &definition.kind {
            ProcessorKind::Limit(config) => Box::new(LimitProcessor::new(name, config.clone())),
            ProcessorKind::Offset(config) => Box::new(OffsetProcessor::new(name, config.clone())),
            ProcessorKind::Relabel(config) => Box::new(RelabelProcessor::new(name, config.clone())),
            ProcessorKind::Script(config) => {
                Box::new(ScriptProcessor::new(name, config.clone(), self.script_engine.clone()))
            }
            ProcessorKind::Sort(config) => Box::new(SortProcessor::new(name, config.clone())),
        }
    }

    pub fn encoder(
        &self,
        definition: &FormatDefinition,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Box<dyn RowEncoder>, PipelineError> {
        Ok(match &definition.kind {
            FormatKind::Json(config) => Box::new(JsonEncoder::new(
                config.clone(),
                title.map(str::to_string),
                description.map(str::to_string),
            )),
            FormatKind::Delimited(config) => Box::new(DelimitedEncoder::new(config.clone())?),
            FormatKind::Html(config) => Box::new(HtmlEncoder::new(config.clone())),
            FormatKind::Spreadsheet(config) => Box::new(SpreadsheetEncoder::new(config.clone())),
            FormatKind::Xml(config) => Box::new(XmlEncoder::new(config.clone())),
        })
    }
}
