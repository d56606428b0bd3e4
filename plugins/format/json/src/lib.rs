//! JSON output: a bare array of row objects, or a document holding the
//! array under `data_name` and optionally column metadata under
//! `metadata_name`.

use serde::Deserialize;

use query_api::{Column, DataType, Row, RowEncoder, StreamError};

pub const EXTENSION: &str = "json";
pub const MEDIA_TYPE: &str = "application/json";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonConfig {
    /// Wrap the rows in an object under this key.
    #[serde(default)]
    pub data_name: Option<String>,
    /// Emit `{ "name", "description", "fields" }` under this key. Only used
    /// together with `data_name`.
    #[serde(default)]
    pub metadata_name: Option<String>,
    /// Report `bool`/`int` instead of the engine's type names in metadata.
    #[serde(default)]
    pub compatible_type_names: bool,
}

pub struct JsonEncoder {
    config: JsonConfig,
    title: Option<String>,
    description: Option<String>,
    started: bool,
}

impl JsonEncoder {
    pub fn new(config: JsonConfig, title: Option<String>, description: Option<String>) -> Self {
        Self { config, title, description, started: false }
    }

    fn type_name(&self, data_type: DataType) -> &'static str {
        match data_type {
            DataType::Boolean if self.config.compatible_type_names => "bool",
            DataType::Integer | DataType::Long if self.config.compatible_type_names => "int",
            other => other.name(),
        }
    }

    fn metadata(&self, columns: &[Column]) -> Result<String, StreamError> {
        let mut meta = String::from("{");
        if let Some(title) = self.title.as_deref().filter(|t| !t.is_empty()) {
            meta.push_str(&format!("\"name\":{},", serde_json::to_string(title)?));
        }
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            meta.push_str(&format!("\"description\":{},", serde_json::to_string(description.trim())?));
        }
        meta.push_str("\"fields\":{");
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                meta.push(',');
            }
            meta.push_str(&format!("{}:\"{}\"", serde_json::to_string(&column.name)?, self.type_name(column.data_type)));
        }
        meta.push_str("}}");
        Ok(meta)
    }
}

fn non_empty(name: &Option<String>) -> Option<&str> {
    name.as_deref().filter(|n| !n.is_empty())
}

impl RowEncoder for JsonEncoder {
    fn header(&mut self, columns: &[Column], out: &mut Vec<u8>) -> Result<(), StreamError> {
        let Some(data_name) = non_empty(&self.config.data_name) else {
            out.push(b'[');
            return Ok(());
        };
        let data_key = serde_json::to_string(data_name)?;
        match non_empty(&self.config.metadata_name) {
            Some(meta_name) => {
                let meta_key = serde_json::to_string(meta_name)?;
                let meta = self.metadata(columns)?;
                out.extend_from_slice(format!("{{{meta_key}:{meta},{data_key}:[").as_bytes());
            }
            None => out.extend_from_slice(format!("{{{data_key}:[").as_bytes()),
        }
        Ok(())
    }

    fn row(&mut self, columns: &[Column], row: &Row, out: &mut Vec<u8>) -> Result<(), StreamError> {
        if self.started {
            out.push(b',');
        }
        self.started = true;
        out.push(b'{');
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            serde_json::to_writer(&mut *out, &column.name)?;
            out.push(b':');
            let value = row.get(&column.name).map(|v| v.to_json()).unwrap_or(serde_json::Value::Null);
            serde_json::to_writer(&mut *out, &value)?;
        }
        out.push(b'}');
        Ok(())
    }

    fn close(&mut self, _row_count: u64, out: &mut Vec<u8>) -> Result<(), StreamError> {
        if non_empty(&self.config.data_name).is_some() {
            out.extend_from_slice(b"]}");
        } else {
            out.push(b']');
        }
        Ok(())
    }
}
