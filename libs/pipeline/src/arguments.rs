use std::cmp::Ordering;

use regex::Regex;

use query_api::{Arguments, Value};

use crate::config::ArgumentDefinition;
use crate::error::PipelineError;

/// Validate the raw request arguments against their declarations.
///
/// Only declared, non-ignored arguments are passed on. A missing mandatory
/// argument, a value outside the permitted pattern or bounds, a value of the
/// wrong type and repeated values for a single-valued argument are all
/// rejected.
pub fn prepare_arguments(definitions: &[ArgumentDefinition], raw: &Arguments) -> Result<Arguments, PipelineError> {
    let mut prepared = Arguments::new();
    for definition in definitions.iter().filter(|d| !d.ignored) {
        let name = definition.name.as_str();
        let mut values = raw.get(name).to_vec();
        if values.is_empty() {
            if !definition.optional {
                return Err(PipelineError::argument(name, "is mandatory and was not provided"));
            }
            if let Some(default) = definition.default_value.as_ref().filter(|d| !d.is_empty()) {
                values.push(default.clone());
            }
        }

        if let Some(pattern) = definition.permitted_values_regex.as_deref().filter(|p| !p.is_empty()) {
            let regex = Regex::new(&format!("^(?:{pattern})$"))
                .map_err(|e| PipelineError::argument(name, format!("does not have a valid permitted_values_regex: {e}")))?;
            if values.iter().any(|v| !regex.is_match(v)) {
                return Err(PipelineError::argument(name, "has been passed a value that does not match its permitted_values_regex"));
            }
        }

        if values.len() > 1 && !definition.multi_valued {
            return Err(PipelineError::argument(
                name,
                format!("has been provided {} times but is not multi-valued", values.len()),
            ));
        }

        let minimum = bound(definition, definition.minimum_value.as_deref())?;
        let maximum = bound(definition, definition.maximum_value.as_deref())?;
        for text in &values {
            let value = Value::parse(text, definition.data_type)
                .map_err(|e| PipelineError::argument(name, e.message().to_string()))?;
            if let Some(min) = &minimum
                && value.compare(min) == Some(Ordering::Less)
            {
                return Err(PipelineError::argument(name, format!("value {text} is below the minimum {min}")));
            }
            if let Some(max) = &maximum
                && value.compare(max) == Some(Ordering::Greater)
            {
                return Err(PipelineError::argument(name, format!("value {text} is above the maximum {max}")));
            }
        }

        if !values.is_empty() {
            prepared.set(name, values);
        }
    }
    Ok(prepared)
}

fn bound(definition: &ArgumentDefinition, text: Option<&str>) -> Result<Option<Value>, PipelineError> {
    text.filter(|t| !t.is_empty())
        .map(|t| Value::parse(t, definition.data_type))
        .transpose()
        .map_err(|e| PipelineError::argument(&definition.name, e.message().to_string()))
}
