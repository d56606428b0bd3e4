use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use query_api::{DataType, Endpoint, Value};
use query_format_delimited::DelimitedConfig;
use query_format_html::HtmlConfig;
use query_format_json::JsonConfig;
use query_format_spreadsheet::SpreadsheetConfig;
use query_format_xml::XmlConfig;
use query_processor_limit::LimitConfig;
use query_processor_offset::OffsetConfig;
use query_processor_relabel::RelabelConfig;
use query_processor_script::ScriptConfig;
use query_processor_sort::SortConfig;
use query_source_sql::SqlSourceConfig;
use query_source_static::StaticSourceConfig;
use query_source_test::TestSourceConfig;

use crate::error::PipelineError;

// ═══════════════════════════════════════════════════════════════
//  Pipeline definition
// ═══════════════════════════════════════════════════════════════

/// Root of a pipeline definition, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Arguments the request may (or must) supply.
    #[serde(default)]
    pub arguments: Vec<ArgumentDefinition>,
    /// Endpoints known to this pipeline, by name.
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
    /// Sub-pipelines run before the source to register more endpoints.
    #[serde(default)]
    pub dynamic_endpoints: Vec<DynamicEndpointDefinition>,
    pub source: SourceDefinition,
    #[serde(default)]
    pub processors: Vec<ProcessorDefinition>,
    /// Output formats; the first one is the default.
    pub formats: Vec<FormatDefinition>,
}

impl PipelineDefinition {
    /// Read and validate a definition file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let context = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::definition(&context, format!("failed to read: {e}")))?;
        Self::parse(&text, &context)
    }

    pub fn parse(text: &str, context: &str) -> Result<Self, PipelineError> {
        let definition: PipelineDefinition =
            toml::from_str(text).map_err(|e| PipelineError::definition(context, e.to_string()))?;
        definition.validate().map_err(|e| e.with_context(context))?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.formats.is_empty() {
            return Err(PipelineError::definition("formats", "at least one format is required"));
        }
        let mut names = HashSet::new();
        for format in &self.formats {
            if !names.insert(format.name()) {
                return Err(PipelineError::definition("formats", format!("duplicate format name '{}'", format.name())));
            }
            format.validate()?;
        }

        let mut names = HashSet::new();
        for argument in &self.arguments {
            if !names.insert(argument.name.as_str()) {
                return Err(PipelineError::definition("arguments", format!("duplicate argument '{}'", argument.name)));
            }
            argument.validate()?;
        }

        self.source.validate("source")?;
        for (i, processor) in self.processors.iter().enumerate() {
            processor.kind.validate(&format!("processors[{i}]"))?;
        }
        for (i, dynamic) in self.dynamic_endpoints.iter().enumerate() {
            dynamic.source.validate(&format!("dynamic_endpoints[{i}].source"))?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Arguments
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ArgumentDefinition {
    pub name: String,
    #[serde(rename = "type", default = "default_argument_type")]
    pub data_type: DataType,
    /// A missing optional argument takes `default_value`, or stays empty.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub multi_valued: bool,
    /// Ignored arguments are never passed to the pipeline.
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub minimum_value: Option<String>,
    #[serde(default)]
    pub maximum_value: Option<String>,
    /// Every value must match this expression in full.
    #[serde(default)]
    pub permitted_values_regex: Option<String>,
}

fn default_argument_type() -> DataType {
    DataType::String
}

impl ArgumentDefinition {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let context = format!("argument '{}'", self.name);
        if self.name.is_empty() {
            return Err(PipelineError::definition("arguments", "argument without a name"));
        }
        if let Some(regex) = &self.permitted_values_regex {
            regex::Regex::new(regex).map_err(|e| PipelineError::definition(&context, format!("invalid permitted_values_regex: {e}")))?;
        }
        for (label, text) in [
            ("default_value", &self.default_value),
            ("minimum_value", &self.minimum_value),
            ("maximum_value", &self.maximum_value),
        ] {
            if let Some(text) = text {
                Value::parse(text, self.data_type)
                    .map_err(|e| PipelineError::definition(&context, format!("{label}: {}", e.message())))?;
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Sources
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDefinition {
    Sql(SqlSourceConfig),
    Static(StaticSourceConfig),
    Test(TestSourceConfig),
}

impl SourceDefinition {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceDefinition::Sql(_) => "sql",
            SourceDefinition::Static(_) => "static",
            SourceDefinition::Test(_) => "test",
        }
    }

    fn validate(&self, context: &str) -> Result<(), PipelineError> {
        match self {
            SourceDefinition::Sql(sql) if sql.query.trim().is_empty() => {
                Err(PipelineError::definition(context, "sql source requires a query"))
            }
            SourceDefinition::Static(s) if s.columns.is_empty() => {
                Err(PipelineError::definition(context, "static source requires at least one column"))
            }
            _ => Ok(()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Processors
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorDefinition {
    #[serde(default)]
    pub name: Option<String>,
    /// Expression over the arguments; the processor is only used when true.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(flatten)]
    pub kind: ProcessorKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorKind {
    Limit(LimitConfig),
    Offset(OffsetConfig),
    Relabel(RelabelConfig),
    Script(ScriptConfig),
    Sort(SortConfig),
}

impl ProcessorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessorKind::Limit(_) => "limit",
            ProcessorKind::Offset(_) => "offset",
            ProcessorKind::Relabel(_) => "relabel",
            ProcessorKind::Script(_) => "script",
            ProcessorKind::Sort(_) => "sort",
        }
    }

    fn validate(&self, context: &str) -> Result<(), PipelineError> {
        match self {
            ProcessorKind::Sort(config) => config.validate().map_err(|e| PipelineError::definition(context, e.message())),
            _ => Ok(()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Dynamic endpoints
// ═══════════════════════════════════════════════════════════════

/// Sub-pipeline whose rows become endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct DynamicEndpointDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub source: SourceDefinition,
    #[serde(default)]
    pub processors: Vec<ProcessorDefinition>,
    /// Endpoint name used when a row has no key.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    #[serde(default = "default_type_field")]
    pub type_field: String,
    #[serde(default = "default_url_field")]
    pub url_field: String,
    #[serde(default = "default_username_field")]
    pub username_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
    #[serde(default = "default_condition_field")]
    pub condition_field: String,
}

fn default_key_field() -> String {
    "key".into()
}
fn default_type_field() -> String {
    "type".into()
}
fn default_url_field() -> String {
    "url".into()
}
fn default_username_field() -> String {
    "username".into()
}
fn default_password_field() -> String {
    "password".into()
}
fn default_condition_field() -> String {
    "condition".into()
}

// ═══════════════════════════════════════════════════════════════
//  Formats
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct FormatDefinition {
    /// Name a request can select; defaults to the format type.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(flatten)]
    pub kind: FormatKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormatKind {
    Json(JsonConfig),
    Delimited(DelimitedConfig),
    Html(HtmlConfig),
    Spreadsheet(SpreadsheetConfig),
    Xml(XmlConfig),
}

impl FormatDefinition {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(match self.kind {
            FormatKind::Json(_) => "json",
            FormatKind::Delimited(_) => "delimited",
            FormatKind::Html(_) => "html",
            FormatKind::Spreadsheet(_) => "spreadsheet",
            FormatKind::Xml(_) => "xml",
        })
    }

    pub fn extension(&self) -> &str {
        self.extension.as_deref().unwrap_or(match self.kind {
            FormatKind::Json(_) => query_format_json::EXTENSION,
            FormatKind::Delimited(_) => query_format_delimited::EXTENSION,
            FormatKind::Html(_) => query_format_html::EXTENSION,
            FormatKind::Spreadsheet(_) => query_format_spreadsheet::EXTENSION,
            FormatKind::Xml(_) => query_format_xml::EXTENSION,
        })
    }

    pub fn media_type(&self) -> &str {
        self.media_type.as_deref().unwrap_or(match self.kind {
            FormatKind::Json(_) => query_format_json::MEDIA_TYPE,
            FormatKind::Delimited(_) => query_format_delimited::MEDIA_TYPE,
            FormatKind::Html(_) => query_format_html::MEDIA_TYPE,
            FormatKind::Spreadsheet(_) => query_format_spreadsheet::MEDIA_TYPE,
            FormatKind::Xml(_) => query_format_xml::MEDIA_TYPE,
        })
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if !self.media_type().contains('/') {
            return Err(PipelineError::definition(
                format!("format '{}'", self.name()),
                format!("invalid media type '{}'", self.media_type()),
            ));
        }
        if let FormatKind::Delimited(config) = &self.kind {
            config.validate().map_err(|e| PipelineError::definition(format!("format '{}'", self.name()), e.message()))?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════

/// Deployment-wide engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Capacity of each source queue.
    #[serde(default = "default_source_buffer")]
    pub source_buffer: usize,
}

fn default_source_buffer() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { source_buffer: default_source_buffer() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"
title = "Demo"

[[arguments]]
name = "limit"
type = "integer"
optional = true
default_value = "5"

[endpoints.main]
type = "sql"
url = "postgres://db/demo"

[source]
type = "test"
row_count = 20
name = "demo"

[[processors]]
type = "limit"
limit = 3
condition = "args.limit != \"0\""

[[processors]]
type = "relabel"
relabels = [{ source = "value", target = "id" }]

[[formats]]
type = "delimited"
delimiter = ";"

[[formats]]
type = "json"
name = "data"
data_name = "rows"
"#;

    #[test]
    fn parses_full_definition() {
        let definition = PipelineDefinition::parse(DEFINITION, "demo.toml").unwrap();
        assert_eq!(definition.title.as_deref(), Some("Demo"));
        assert_eq!(definition.arguments[0].data_type, DataType::Integer);
        assert!(definition.endpoints.contains_key("main"));
        assert!(matches!(&definition.source, SourceDefinition::Test(t) if t.row_count == 20));

        assert_eq!(definition.processors.len(), 2);
        assert!(matches!(&definition.processors[0].kind, ProcessorKind::Limit(l) if l.limit == 3));
        assert!(definition.processors[0].condition.is_some());

        let csv = &definition.formats[0];
        assert_eq!((csv.name(), csv.extension(), csv.media_type()), ("delimited", "csv", "text/csv"));
        assert!(matches!(&csv.kind, FormatKind::Delimited(d) if d.delimiter == ";" && d.header));
        assert_eq!(definition.formats[1].name(), "data");
    }

    #[test]
    fn rejects_missing_formats() {
        let text = "[source]\ntype = \"test\"\nformats = []\n";
        assert!(PipelineDefinition::parse(text, "x").is_err());

        let text = "formats = []\n[source]\ntype = \"test\"\n";
        let err = PipelineDefinition::parse(text, "x").unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(err.to_string().contains("at least one format"));
    }

    #[test]
    fn rejects_bad_argument_declarations() {
        let text = r#"
[[arguments]]
name = "id"
type = "integer"
default_value = "abc"

[source]
type = "test"

[[formats]]
type = "json"
"#;
        let err = PipelineDefinition::parse(text, "x").unwrap_err();
        assert!(err.to_string().contains("default_value"));
    }

    #[test]
    fn rejects_unknown_source_type() {
        let text = "[source]\ntype = \"ftp\"\n[[formats]]\ntype = \"json\"\n";
        assert!(matches!(PipelineDefinition::parse(text, "x"), Err(PipelineError::Definition { .. })));
    }

    #[test]
    fn sort_and_xml_definitions() {
        let text = r#"
[source]
type = "test"

[[processors]]
type = "sort"
fields = ["-value", "name"]

[[formats]]
type = "xml"
row_name = "item"
"#;
        let definition = PipelineDefinition::parse(text, "x").unwrap();
        assert!(matches!(&definition.processors[0].kind, ProcessorKind::Sort(s) if s.fields == ["-value", "name"]));
        let xml = &definition.formats[0];
        assert_eq!((xml.name(), xml.extension(), xml.media_type()), ("xml", "xml", "application/xml"));
        assert!(matches!(&xml.kind, FormatKind::Xml(x) if x.row_name == "item" && x.doc_name == "data"));

        let text = "[source]\ntype = \"test\"\n[[processors]]\ntype = \"sort\"\nfields = []\n[[formats]]\ntype = \"json\"\n";
        let err = PipelineDefinition::parse(text, "x").unwrap_err();
        assert!(err.to_string().contains("No fields provided for sorting"));
    }

    #[test]
    fn engine_defaults() {
        let engine: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(engine.source_buffer, 1000);
    }
}
