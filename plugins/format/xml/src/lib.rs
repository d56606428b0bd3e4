use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use query_api::{Column, Row, RowEncoder, StreamError};

pub const EXTENSION: &str = "xml";
pub const MEDIA_TYPE: &str = "application/xml";

#[derive(Debug, Clone, Deserialize)]
pub struct XmlConfig {
    /// Emit `<?xml version="1.0" encoding="utf-8"?>` before the root element.
    #[serde(default = "default_true")]
    pub xml_declaration: bool,
    #[serde(default)]
    pub indent: bool,
    /// Write each field as an attribute of the row element instead of a child element.
    #[serde(default)]
    pub fields_as_attributes: bool,
    #[serde(default = "default_doc_name")]
    pub doc_name: String,
    #[serde(default = "default_row_name")]
    pub row_name: String,
    /// Replaces an invalid first character of a field name.
    #[serde(default = "default_initial_letter_fix")]
    pub field_initial_letter_fix: String,
    /// Replaces each run of invalid characters inside a field name.
    #[serde(default = "default_invalid_letter_fix")]
    pub field_invalid_letter_fix: String,
}

fn default_true() -> bool {
    true
}

fn default_doc_name() -> String {
    "data".to_string()
}

fn default_row_name() -> String {
    "row".to_string()
}

fn default_initial_letter_fix() -> String {
    "F".to_string()
}

fn default_invalid_letter_fix() -> String {
    "_".to_string()
}

impl Default for XmlConfig {
    fn default() -> Self {
        Self {
            xml_declaration: true,
            indent: false,
            fields_as_attributes: false,
            doc_name: default_doc_name(),
            row_name: default_row_name(),
            field_initial_letter_fix: default_initial_letter_fix(),
            field_invalid_letter_fix: default_invalid_letter_fix(),
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c.is_numeric() || c == '-' || c == '.'
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(is_name_start) && chars.all(is_name_char)
}

/// Maps column names to valid, unique XML element names.
#[derive(Default)]
struct NameMap {
    names: HashMap<String, String>,
    used: HashSet<String>,
}

impl NameMap {
    fn get(&mut self, config: &XmlConfig, original: &str, fallback: &str) -> String {
        if let Some(name) = self.names.get(original) {
            return name.clone();
        }
        let mut built = String::new();
        if is_valid_name(original) {
            built.push_str(original);
        } else {
            let mut last_valid = true;
            for (i, c) in original.chars().enumerate() {
                let valid = if i == 0 { is_name_start(c) } else { is_name_char(c) };
                if valid {
                    built.push(c);
                } else if i == 0 {
                    built.push_str(&config.field_initial_letter_fix);
                } else if last_valid {
                    built.push_str(&config.field_invalid_letter_fix);
                }
                last_valid = valid;
            }
            if !is_valid_name(&built) {
                built = fallback.to_string();
            }
        }
        let mut name = built.clone();
        let mut suffix = 1;
        while self.used.contains(&name) {
            name = format!("{built}{suffix}");
            suffix += 1;
        }
        self.used.insert(name.clone());
        self.names.insert(original.to_string(), name.clone());
        name
    }
}

fn escape(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

/// One root element holding one element per row; null fields are omitted.
pub struct XmlEncoder {
    config: XmlConfig,
    names: NameMap,
    root: String,
    row: String,
}

impl XmlEncoder {
    pub fn new(config: XmlConfig) -> Self {
        let mut names = NameMap::default();
        let root = names.get(&config, &config.doc_name, "data");
        let row = names.get(&config, &config.row_name, "row");
        Self { config, names, root, row }
    }
}

impl RowEncoder for XmlEncoder {
    fn open(&mut self, out: &mut Vec<u8>) -> Result<(), StreamError> {
        let mut text = String::new();
        if self.config.xml_declaration {
            text.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>");
            if self.config.indent {
                text.push('\n');
            }
        }
        text.push_str(&format!("<{}>", self.root));
        out.extend_from_slice(text.as_bytes());
        Ok(())
    }

    fn header(&mut self, _columns: &[Column], _out: &mut Vec<u8>) -> Result<(), StreamError> {
        Ok(())
    }

    fn row(&mut self, columns: &[Column], row: &Row, out: &mut Vec<u8>) -> Result<(), StreamError> {
        let indent = self.config.indent;
        let mut text = String::new();
        if indent {
            text.push_str("\n  ");
        }
        text.push('<');
        text.push_str(&self.row);
        let mut children = String::new();
        for (i, column) in columns.iter().enumerate() {
            let Some(value) = row.get(&column.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let name = self.names.get(&self.config, &column.name, &format!("field{}", i + 1));
            if self.config.fields_as_attributes {
                text.push_str(&format!(" {name}=\""));
                escape(&value.to_string(), &mut text);
                text.push('"');
            } else {
                if indent {
                    children.push_str("\n    ");
                }
                children.push_str(&format!("<{name}>"));
                escape(&value.to_string(), &mut children);
                children.push_str(&format!("</{name}>"));
            }
        }
        text.push('>');
        text.push_str(&children);
        if indent {
            text.push_str("\n  ");
        }
        text.push_str(&format!("</{}>", self.row));
        out.extend_from_slice(text.as_bytes());
        Ok(())
    }

    fn close(&mut self, _row_count: u64, out: &mut Vec<u8>) -> Result<(), StreamError> {
        if self.config.indent {
            out.push(b'\n');
        }
        out.extend_from_slice(format!("</{}>", self.root).as_bytes());
        Ok(())
    }
}
