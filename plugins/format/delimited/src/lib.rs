//! Delimited text output (CSV, TSV and friends).
//!
//! Strings and header names are quoted with `open_quote`/`close_quote`,
//! numbers and booleans are written bare, nulls as nothing. Temporal values
//! use the configured chrono patterns and are quoted unless
//! `quote_temporal` is off.

use serde::Deserialize;

use query_api::{Column, Row, RowEncoder, StreamError, Value};

pub const EXTENSION: &str = "csv";
pub const MEDIA_TYPE: &str = "text/csv";

#[derive(Debug, Clone, Deserialize)]
pub struct DelimitedConfig {
    #[serde(default = "default_header")]
    pub header: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_quote")]
    pub open_quote: String,
    #[serde(default = "default_quote")]
    pub close_quote: String,
    /// Prefix written before a close quote found inside a value.
    #[serde(default = "default_quote")]
    pub escape_close_quote: String,
    /// Replacement for a close quote found inside a value; used only when
    /// `escape_close_quote` is empty.
    #[serde(default)]
    pub replace_close_quote: String,
    #[serde(default = "default_new_line")]
    pub new_line: String,
    /// Start the output with a UTF-8 byte order mark.
    #[serde(default)]
    pub bom: bool,
    #[serde(default = "default_quote_temporal")]
    pub quote_temporal: bool,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_time_format")]
    pub time_format: String,
    /// ISO-8601 when unset.
    #[serde(default)]
    pub date_time_format: Option<String>,
}

fn default_header() -> bool {
    true
}

fn default_quote_temporal() -> bool {
    true
}

fn default_delimiter() -> String {
    ",".into()
}

fn default_quote() -> String {
    "\"".into()
}

fn default_new_line() -> String {
    "\r\n".into()
}

fn default_date_format() -> String {
    "%Y-%m-%d".into()
}

fn default_time_format() -> String {
    "%H:%M".into()
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            header: default_header(),
            delimiter: default_delimiter(),
            open_quote: default_quote(),
            close_quote: default_quote(),
            escape_close_quote: default_quote(),
            replace_close_quote: String::new(),
            new_line: default_new_line(),
            bom: false,
            quote_temporal: default_quote_temporal(),
            date_format: default_date_format(),
            time_format: default_time_format(),
            date_time_format: None,
        }
    }
}

impl DelimitedConfig {
    /// Tab separated, no quoting.
    pub fn tab_separated() -> Self {
        Self {
            delimiter: "\t".into(),
            open_quote: String::new(),
            close_quote: String::new(),
            escape_close_quote: String::new(),
            new_line: "\n".into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.new_line.is_empty() {
            return Err(StreamError::config("delimited format: new_line must not be empty"));
        }
        for pattern in [&self.date_format, &self.time_format] {
            check_pattern(pattern)?;
        }
        if let Some(pattern) = &self.date_time_format {
            check_pattern(pattern)?;
        }
        Ok(())
    }
}

fn check_pattern(pattern: &str) -> Result<(), StreamError> {
    use chrono::format::{Item, StrftimeItems};
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(StreamError::config(format!("delimited format: invalid pattern `{pattern}`")));
    }
    Ok(())
}

pub struct DelimitedEncoder {
    config: DelimitedConfig,
}

impl DelimitedEncoder {
    pub fn new(config: DelimitedConfig) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self { config })
    }

    fn quoted(&self, text: &str, line: &mut String) {
        let config = &self.config;
        line.push_str(&config.open_quote);
        if config.close_quote.is_empty() {
            line.push_str(text);
        } else if !config.escape_close_quote.is_empty() {
            let escaped = format!("{}{}", config.escape_close_quote, config.close_quote);
            line.push_str(&text.replace(&config.close_quote, &escaped));
        } else if !config.replace_close_quote.is_empty() {
            line.push_str(&text.replace(&config.close_quote, &config.replace_close_quote));
        } else {
            line.push_str(text);
        }
        line.push_str(&config.close_quote);
    }

    fn temporal(&self, text: String, line: &mut String) {
        if self.config.quote_temporal {
            self.quoted(&text, line);
        } else {
            line.push_str(&text);
        }
    }

    fn field(&self, value: &Value, line: &mut String) {
        match value {
            Value::Null => {}
            Value::Boolean(_) | Value::Integer(_) | Value::Long(_) | Value::Float(_) | Value::Double(_) => {
                line.push_str(&value.to_string())
            }
            Value::String(s) => self.quoted(s, line),
            Value::Date(d) => self.temporal(d.format(&self.config.date_format).to_string(), line),
            Value::Time(t) => self.temporal(t.format(&self.config.time_format).to_string(), line),
            Value::DateTime(dt) => {
                let text = match &self.config.date_time_format {
                    Some(pattern) => dt.format(pattern).to_string(),
                    None => value.to_string(),
                };
                self.temporal(text, line)
            }
        }
    }
}

impl RowEncoder for DelimitedEncoder {
    fn header(&mut self, columns: &[Column], out: &mut Vec<u8>) -> Result<(), StreamError> {
        let mut line = String::new();
        if self.config.bom {
            line.push('\u{FEFF}');
        }
        if self.config.header {
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    line.push_str(&self.config.delimiter);
                }
                self.quoted(&column.name, &mut line);
            }
            line.push_str(&self.config.new_line);
        }
        out.extend_from_slice(line.as_bytes());
        Ok(())
    }

    fn row(&mut self, columns: &[Column], row: &Row, out: &mut Vec<u8>) -> Result<(), StreamError> {
        let mut line = String::new();
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                line.push_str(&self.config.delimiter);
            }
            if let Some(value) = row.get(&column.name) {
                self.field(value, &mut line);
            }
        }
        line.push_str(&self.config.new_line);
        out.extend_from_slice(line.as_bytes());
        Ok(())
    }
}
