use query_api::{Arguments, Endpoint, EndpointKind, Row, StreamError};
use query_stream::{FormattingSink, RowCapture, SourceContext};

use crate::catalog::Catalog;
use crate::config::DynamicEndpointDefinition;
use crate::error::PipelineError;
use crate::graph::{Graph, build_chain};

/// Run the sub-pipeline of one dynamic-endpoint definition to completion and
/// register an endpoint per captured row. Returns the number registered.
pub(crate) async fn register_dynamic_endpoints(
    index: usize,
    definition: &DynamicEndpointDefinition,
    catalog: &Catalog,
    context: SourceContext,
) -> Result<usize, PipelineError> {
    let name = definition
        .name
        .clone()
        .unwrap_or_else(|| format!("dynamic_endpoints[{index}]"));
    let ctx = context.ctx.clone();
    let arguments = context.arguments.clone();
    let endpoints = context.endpoints.clone();

    let chain = build_chain(catalog, &definition.source, &definition.processors, context)
        .await
        .map_err(|e| e.with_context(&name))?;
    let capture = RowCapture::new();
    let sink = FormattingSink::new(ctx.clone(), Box::new(capture.clone()));
    let graph = Graph::new(name.as_str(), ctx, chain, sink);
    graph.run().await.map_err(|e| PipelineError::from(e).with_context(&name))?;

    let rows = capture.take();
    tracing::debug!(preprocessor = %name, rows = rows.len(), "dynamic endpoint rows captured");

    let mut registered = 0;
    for (i, row) in rows.iter().enumerate() {
        let Some((key, endpoint)) = endpoint_from_row(definition, catalog, &arguments, row)
            .map_err(|e| PipelineError::from(e).with_context(format!("{name} row {i}")))?
        else {
            continue;
        };
        tracing::debug!(preprocessor = %name, endpoint = %key, kind = ?endpoint.kind, "endpoint registered");
        endpoints.insert(key, endpoint);
        registered += 1;
    }
    Ok(registered)
}

fn field(row: &Row, name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    row.get(name).filter(|v| !v.is_null()).map(|v| v.to_string())
}

/// `None` when the row's condition rejects it.
fn endpoint_from_row(
    definition: &DynamicEndpointDefinition,
    catalog: &Catalog,
    arguments: &Arguments,
    row: &Row,
) -> Result<Option<(String, Endpoint)>, StreamError> {
    let kind = match field(row, &definition.type_field).filter(|t| !t.trim().is_empty()) {
        Some(text) => text.parse::<EndpointKind>().map_err(StreamError::source)?,
        None => EndpointKind::Sql,
    };
    let key = field(row, &definition.key_field)
        .filter(|k| !k.is_empty())
        .or_else(|| definition.key.clone().filter(|k| !k.is_empty()))
        .ok_or_else(|| {
            StreamError::source(format!(
                "no key specified for dynamic endpoint (field '{}')",
                definition.key_field
            ))
        })?;
    let condition = field(row, &definition.condition_field).filter(|c| !c.trim().is_empty());

    if let Some(condition) = &condition {
        let expression = catalog.script_engine().compile(condition)?;
        if !expression.test(arguments, Some(row))? {
            tracing::debug!(endpoint = %key, condition = %condition, "endpoint rejected by condition");
            return Ok(None);
        }
    }

    let endpoint = Endpoint {
        kind,
        url: field(row, &definition.url_field),
        username: field(row, &definition.username_field),
        password: field(row, &definition.password_field),
        condition,
    };
    Ok(Some((key, endpoint)))
}
