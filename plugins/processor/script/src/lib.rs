pub mod engine;

pub use engine::RhaiEngine;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;

use query_api::{Arguments, DataType, ErrorKind, Expression, Row, Schema, ScriptEngine, StreamError};
use query_stream::{Processor, ProcessorOutput, Transform, TransformFuture, Transformed};

/// What happens to a row whose script fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Report the fault and drop the row.
    #[default]
    Skip,
    /// Fail the pipeline.
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComputedField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub expression: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptConfig {
    /// Rows for which the predicate is false are dropped.
    #[serde(default)]
    pub predicate: Option<String>,
    /// Columns computed per row, appended to (or replacing) upstream ones.
    #[serde(default)]
    pub fields: Vec<ComputedField>,
    #[serde(default)]
    pub on_error: OnError,
}

pub struct ScriptProcessor {
    name: String,
    config: ScriptConfig,
    engine: Arc<dyn ScriptEngine>,
}

impl ScriptProcessor {
    pub fn new(name: impl Into<String>, config: ScriptConfig, engine: Arc<dyn ScriptEngine>) -> Self {
        Self { name: name.into(), config, engine }
    }

    fn compile(&self) -> Result<Compiled, StreamError> {
        let context = |e: StreamError| e.with_context(format!("script [{}]", self.name));
        let predicate = match &self.config.predicate {
            Some(source) => Some(self.engine.compile(source).map_err(context)?),
            None => None,
        };
        let mut fields = Vec::with_capacity(self.config.fields.len());
        for field in &self.config.fields {
            let expression = self.engine.compile(&field.expression).map_err(context)?;
            fields.push((field.name.clone(), field.data_type, expression));
        }
        Ok(Compiled { predicate, fields })
    }
}

struct Compiled {
    predicate: Option<Arc<dyn Expression>>,
    fields: Vec<(String, DataType, Arc<dyn Expression>)>,
}

struct ScriptRows {
    name: String,
    compiled: Compiled,
    arguments: Arguments,
    schema: Arc<Schema>,
    on_error: OnError,
}

impl ScriptRows {
    fn run(&self, row: Row) -> Result<Transformed<Row>, StreamError> {
        let mut row = row.rebase(self.schema.clone())?;
        if let Some(predicate) = &self.compiled.predicate
            && !predicate.test(&self.arguments, Some(&row))?
        {
            return Ok(Transformed::Skip);
        }
        for (name, data_type, expression) in &self.compiled.fields {
            let value = expression
                .evaluate(&self.arguments, Some(&row))?
                .coerce(*data_type)
                .map_err(|e| e.with_context(format!("field {name}")))?;
            row.put(name.clone(), value)?;
        }
        Ok(Transformed::Emit(row))
    }
}

impl Transform<Row> for ScriptRows {
    fn apply(&self, row: Row) -> TransformFuture<Row> {
        let result = self.run(row).map_err(|e| {
            let kind = match self.on_error {
                OnError::Skip => ErrorKind::Transform,
                OnError::Fail => ErrorKind::Abort,
            };
            tracing::warn!(processor = %self.name, error = %e, "script failed on row");
            StreamError::new(kind, e.message())
        });
        Box::pin(async move { result })
    }
}

impl Processor for ScriptProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(
        &self,
        upstream: Arc<Schema>,
        arguments: &Arguments,
    ) -> BoxFuture<'static, Result<ProcessorOutput, StreamError>> {
        let result = self.compile().and_then(|compiled| {
            let schema = Arc::new(upstream.snapshot());
            for (name, data_type, _) in &compiled.fields {
                schema.register(name, *data_type)?;
            }
            let transform = Arc::new(ScriptRows {
                name: self.name.clone(),
                compiled,
                arguments: arguments.clone(),
                schema: schema.clone(),
                on_error: self.config.on_error,
            });
            Ok(ProcessorOutput::Stage { schema, transform })
        });
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_api::{Column, Value};

    async fn transform_for(config: ScriptConfig, upstream: Arc<Schema>) -> (Arc<Schema>, Arc<dyn Transform<Row>>) {
        let processor = ScriptProcessor::new("script", config, Arc::new(RhaiEngine::new()));
        let args: Arguments = [("min", "2")].into_iter().collect();
        match processor.initialize(upstream, &args).await.unwrap() {
            ProcessorOutput::Stage { schema, transform } => (schema, transform),
            ProcessorOutput::Passthrough => panic!("script must create a stage"),
        }
    }

    fn upstream() -> Arc<Schema> {
        Arc::new(Schema::with_columns([Column::new("value", DataType::Integer)]))
    }

    fn row(schema: &Arc<Schema>, v: i32) -> Row {
        Row::new(schema.clone()).with("value", v).unwrap()
    }

    #[tokio::test]
    async fn predicate_filters_rows() {
        let config = ScriptConfig { predicate: Some("value >= parse_int(args.min)".into()), ..Default::default() };
        let schema = upstream();
        let (_, transform) = transform_for(config, schema.clone()).await;

        assert!(matches!(transform.apply(row(&schema, 1)).await.unwrap(), Transformed::Skip));
        assert!(matches!(transform.apply(row(&schema, 2)).await.unwrap(), Transformed::Emit(_)));
    }

    #[tokio::test]
    async fn computed_fields_are_registered_before_rows() {
        let config = ScriptConfig {
            fields: vec![ComputedField { name: "double".into(), data_type: DataType::Integer, expression: "value * 2".into() }],
            ..Default::default()
        };
        let input = upstream();
        let (schema, transform) = transform_for(config, input.clone()).await;
        assert_eq!(schema.data_type("double"), Some(DataType::Integer));
        assert_eq!(input.data_type("double"), None);

        let Transformed::Emit(out) = transform.apply(row(&input, 21)).await.unwrap() else {
            panic!("row should pass");
        };
        assert_eq!(out.get("double"), Some(&Value::Integer(42)));
        assert!(Arc::ptr_eq(out.schema(), &schema));
    }

    #[tokio::test]
    async fn failure_kind_follows_on_error() {
        let field = ComputedField { name: "ratio".into(), data_type: DataType::Long, expression: "10 / value".into() };
        let schema = upstream();

        let skip = ScriptConfig { fields: vec![field.clone()], ..Default::default() };
        let (_, transform) = transform_for(skip, schema.clone()).await;
        let err = transform.apply(row(&schema, 0)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Transform);

        let fail = ScriptConfig { fields: vec![field], on_error: OnError::Fail, ..Default::default() };
        let (_, transform) = transform_for(fail, schema.clone()).await;
        let err = transform.apply(row(&schema, 0)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Abort);
    }

    #[tokio::test]
    async fn invalid_expression_fails_initialize() {
        let config = ScriptConfig { predicate: Some("value >".into()), ..Default::default() };
        let processor = ScriptProcessor::new("script", config, Arc::new(RhaiEngine::new()));
        let err = processor.initialize(upstream(), &Arguments::new()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.message().starts_with("script [script]"));
    }
}
