use std::sync::Arc;

use tokio::io::AsyncReadExt;

use query_api::{Arguments, Column, DataType, Endpoint, StreamError, Value};
use query_pipeline::{
    Catalog, Composer, EngineConfig, FormatRequest, MemoryAuditor, PipelineDefinition, PipelineError, PipelineState,
    RunRequest, RunSummary,
};
use query_pipeline::config::FormatKind;
use query_source_sql::{SqlConnection, SqlCursor, SqlDriver};

// ═══════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════

fn definition(text: &str) -> Arc<PipelineDefinition> {
    Arc::new(PipelineDefinition::parse(text, "test").unwrap())
}

fn request(arguments: &[(&str, &str)]) -> RunRequest {
    RunRequest {
        pipeline: "test".into(),
        arguments: arguments.iter().copied().collect(),
        format: FormatRequest::default(),
    }
}

async fn run(
    composer: &Composer,
    definition: Arc<PipelineDefinition>,
    request: RunRequest,
) -> (Result<RunSummary, PipelineError>, String) {
    let instance = composer.prepare(definition, request).unwrap();
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let (result, output) = tokio::join!(instance.run(writer), async move {
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        out
    });
    (result, output)
}

fn composer(auditor: &Arc<MemoryAuditor>) -> Composer {
    Composer::new(Catalog::new(), auditor.clone(), EngineConfig { source_buffer: 4 })
}

// ═══════════════════════════════════════════════════════════════
//  Happy paths
// ═══════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn static_rows_as_csv() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(
        r#"
[source]
type = "static"
columns = [{ name = "a", type = "integer" }]
rows = [[1], [2]]

[[formats]]
type = "delimited"
"#,
    );

    let (result, output) = run(&composer(&auditor), definition, request(&[])).await;
    let summary = result.unwrap();
    assert_eq!(summary.rows, 2);
    assert_eq!(output, "\"a\"\r\n1\r\n2\r\n");

    let record = auditor.record(&summary.run_id).unwrap();
    assert_eq!(record.completed, Some(2));
    assert_eq!(record.rows_written, Some(2));
    assert!(record.failure.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn limit_stops_the_source() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(
        r#"
[source]
type = "test"
row_count = 10

[[processors]]
type = "limit"
limit = 3

[[formats]]
type = "json"
"#,
    );

    let (result, output) = run(&composer(&auditor), definition, request(&[])).await;
    assert_eq!(result.unwrap().rows, 3);
    assert_eq!(output, r#"[{"value":0},{"value":1},{"value":2}]"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sorted_rows_as_xml() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(
        r#"
[source]
type = "test"
row_count = 6

[[processors]]
type = "sort"
fields = ["-value"]

[[processors]]
type = "limit"
limit = 2

[[formats]]
type = "xml"
xml_declaration = false
"#,
    );

    let (result, output) = run(&composer(&auditor), definition, request(&[])).await;
    assert_eq!(result.unwrap().rows, 2);
    assert_eq!(output, "<data><row><value>5</value></row><row><value>4</value></row></data>");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_relabel_and_offset_chain() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(
        r#"
title = "Evens"

[source]
type = "test"
row_count = 8

[[processors]]
type = "script"
predicate = "value % 2 == 0"
fields = [{ name = "tenfold", type = "long", expression = "value * 10" }]

[[processors]]
type = "offset"
offset = 1

[[processors]]
type = "relabel"
relabels = [{ source = "value", target = "n" }]

[[formats]]
type = "json"
data_name = "data"
metadata_name = "meta"
"#,
    );

    let (result, output) = run(&composer(&auditor), definition, request(&[])).await;
    assert_eq!(result.unwrap().rows, 3);
    assert_eq!(
        output,
        r#"{"meta":{"name":"Evens","fields":{"n":"integer","tenfold":"long"}},"data":[{"n":2,"tenfold":20},{"n":4,"tenfold":40},{"n":6,"tenfold":60}]}"#
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn format_is_selected_by_request() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(
        r#"
[source]
type = "static"
columns = [{ name = "a", type = "string" }]
rows = [["x"]]

[[formats]]
type = "json"

[[formats]]
type = "html"
"#,
    );

    let composer = composer(&auditor);
    let mut by_accept = request(&[]);
    by_accept.format = FormatRequest::by_accept("text/html;q=0.9, application/json;q=0.5");
    let instance = composer.prepare(definition.clone(), by_accept).unwrap();
    assert_eq!(instance.content_type(), "text/html");
    assert_eq!(instance.extension(), "html");

    let mut unknown = request(&[]);
    unknown.format = FormatRequest::by_name("pdf");
    let err = composer.prepare(definition, unknown).err().unwrap();
    assert_eq!(err.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conditional_processor_follows_arguments() {
    let auditor = Arc::new(MemoryAuditor::new());
    let text = r#"
[[arguments]]
name = "top"
optional = true
default_value = "no"

[source]
type = "test"
row_count = 5

[[processors]]
type = "limit"
limit = 2
condition = "args.top == \"yes\""

[[formats]]
type = "json"
"#;
    let composer = composer(&auditor);

    let (result, _) = run(&composer, definition(text), request(&[("top", "yes")])).await;
    assert_eq!(result.unwrap().rows, 2);

    let (result, _) = run(&composer, definition(text), request(&[])).await;
    assert_eq!(result.unwrap().rows, 5);
}

// ═══════════════════════════════════════════════════════════════
//  Failures
// ═══════════════════════════════════════════════════════════════

const DIVIDING: &str = r#"
[source]
type = "test"
row_count = 6

[[processors]]
type = "script"
on_error = "ON_ERROR"
fields = [{ name = "ratio", type = "long", expression = "60 / (value - 3)" }]

[[formats]]
type = "json"
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn row_faults_are_dropped_and_counted() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(&DIVIDING.replace("ON_ERROR", "skip"));

    let (result, output) = run(&composer(&auditor), definition, request(&[])).await;
    let summary = result.unwrap();
    assert_eq!(summary.rows, 5);
    assert_eq!(summary.dropped, 1);
    assert!(!output.contains(r#""value":3"#));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fatal_fault_fails_the_run_with_closed_output() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(&DIVIDING.replace("ON_ERROR", "fail"));
    let composer = composer(&auditor);

    let instance = composer.prepare(definition, request(&[])).unwrap();
    let run_id = instance.run_id().to_string();
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let (result, output) = tokio::join!(instance.run(writer), async move {
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        out
    });

    let err = result.unwrap_err();
    assert_eq!(err.status(), 500);
    assert_eq!(instance.state(), PipelineState::Failed);
    assert!(output.starts_with('['), "{output}");
    assert!(output.ends_with(']'), "{output}");
    assert!(!output.contains(r#""value":3"#));

    let (status, _) = auditor.record(&run_id).unwrap().failure.unwrap();
    assert_eq!(status, 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_mandatory_argument_is_rejected_before_running() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(
        r#"
[[arguments]]
name = "region"

[source]
type = "test"

[[formats]]
type = "json"
"#,
    );

    let err = composer(&auditor).prepare(definition, request(&[])).err().unwrap();
    assert!(matches!(err, PipelineError::Argument { .. }), "{err}");
    assert_eq!(err.status(), 400);

    let (_, record) = auditor.records().pop().unwrap();
    assert_eq!(record.failure.map(|(status, _)| status), Some(400));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instance_runs_only_once() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(
        r#"
[source]
type = "test"
row_count = 1

[[formats]]
type = "json"
"#,
    );
    let instance = composer(&auditor).prepare(definition, request(&[])).unwrap();
    assert_eq!(instance.state(), PipelineState::Created);

    instance.run(tokio::io::sink()).await.unwrap();
    assert_eq!(instance.state(), PipelineState::Completed);

    let err = instance.run(tokio::io::sink()).await.unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyRan));
}

// ═══════════════════════════════════════════════════════════════
//  Dynamic endpoints
// ═══════════════════════════════════════════════════════════════

/// Answers every query with one row naming the endpoint it was reached on.
struct EchoDriver;

struct EchoConnection {
    url: String,
}

struct EchoCursor {
    row: Option<Vec<Value>>,
}

impl SqlDriver for EchoDriver {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn SqlConnection>, StreamError> {
        let url = endpoint.url.clone().ok_or_else(|| StreamError::source("no url"))?;
        Ok(Box::new(EchoConnection { url }))
    }
}

impl SqlConnection for EchoConnection {
    fn query<'a>(&'a mut self, sql: &str, arguments: &Arguments) -> Result<Box<dyn SqlCursor + 'a>, StreamError> {
        let region = arguments.first("region").unwrap_or_default().to_string();
        let row = vec![Value::from(self.url.as_str()), Value::from(sql), Value::from(region.as_str())];
        Ok(Box::new(EchoCursor { row: Some(row) }))
    }
}

impl SqlCursor for EchoCursor {
    fn columns(&self) -> Vec<Column> {
        vec![
            Column::new("url", DataType::String),
            Column::new("sql", DataType::String),
            Column::new("region", DataType::String),
        ]
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, StreamError> {
        Ok(self.row.take())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dynamic_endpoint_feeds_sql_source() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(
        r#"
[[arguments]]
name = "region"
permitted_values_regex = "eu|us"

[[dynamic_endpoints]]
[dynamic_endpoints.source]
type = "static"
columns = [
  { name = "key", type = "string" },
  { name = "url", type = "string" },
  { name = "condition", type = "string" },
]
rows = [
  ["warehouse", "mem://eu", "args.region == \"eu\""],
  ["warehouse", "mem://us", "args.region == \"us\""],
]

[source]
type = "sql"
endpoint = "warehouse"
query = "select 1"

[[formats]]
type = "json"
"#,
    );
    let composer = Composer::new(
        Catalog::new().with_sql_driver(Arc::new(EchoDriver)),
        auditor.clone(),
        EngineConfig::default(),
    );

    let (result, output) = run(&composer, definition, request(&[("region", "us")])).await;
    let summary = result.unwrap();
    assert_eq!(output, r#"[{"url":"mem://us","sql":"select 1","region":"us"}]"#);
    let sources = auditor.record(&summary.run_id).unwrap().sources;
    assert_eq!(sources.len(), 2);
    assert_eq!(sources.last().map(String::as_str), Some("mem://us"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encoder_failure_fails_the_run_before_any_output() {
    let auditor = Arc::new(MemoryAuditor::new());
    let mut parsed = PipelineDefinition::parse(
        r#"
[source]
type = "test"
row_count = 3

[[formats]]
type = "delimited"
"#,
        "test",
    )
    .unwrap();
    let FormatKind::Delimited(config) = &mut parsed.formats[0].kind else {
        panic!("delimited format expected");
    };
    config.date_format = "%Q".into();

    let (result, output) = run(&composer(&auditor), Arc::new(parsed), request(&[])).await;
    let err = result.unwrap_err();
    assert!(err.to_string().contains("invalid pattern"));
    assert!(output.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_endpoint_fails_the_run() {
    let auditor = Arc::new(MemoryAuditor::new());
    let definition = definition(
        r#"
[source]
type = "sql"
endpoint = "nowhere"
query = "select 1"

[[formats]]
type = "delimited"
"#,
    );
    let composer = Composer::new(
        Catalog::new().with_sql_driver(Arc::new(EchoDriver)),
        auditor.clone(),
        EngineConfig::default(),
    );

    let (result, output) = run(&composer, definition, request(&[])).await;
    let err = result.unwrap_err();
    assert_eq!(err.status(), 400, "{err}");
    assert!(err.to_string().contains("nowhere"));
    assert!(output.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn demo_definition_runs() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../demos/numbers.toml");
    let definition = Arc::new(PipelineDefinition::load(path).unwrap());
    let auditor = Arc::new(MemoryAuditor::new());

    let mut csv = request(&[("parity", "odd")]);
    csv.format = FormatRequest::by_extension("csv");
    let (result, output) = run(&composer(&auditor), definition, csv).await;
    assert_eq!(result.unwrap().rows, 10);
    let lines: Vec<&str> = output.split("\r\n").collect();
    assert_eq!(lines[0], "\"value\",\"square\"");
    assert_eq!(lines[1], "1,1");
    assert_eq!(lines[10], "19,361");
}
