//! SpreadsheetML 2003 workbook: a single worksheet, header row in bold,
//! typed cells (`Number`, `Boolean`, `DateTime`, `String`).

use serde::Deserialize;

use query_api::{Column, Row, RowEncoder, StreamError, Value};

pub const EXTENSION: &str = "xml";
pub const MEDIA_TYPE: &str = "application/vnd.ms-excel";

#[derive(Debug, Clone, Deserialize)]
pub struct SpreadsheetConfig {
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
    #[serde(default = "default_true")]
    pub header: bool,
}

fn default_sheet_name() -> String {
    "data".into()
}

fn default_true() -> bool {
    true
}

impl Default for SpreadsheetConfig {
    fn default() -> Self {
        Self { sheet_name: default_sheet_name(), header: true }
    }
}

pub struct SpreadsheetEncoder {
    config: SpreadsheetConfig,
}

impl SpreadsheetEncoder {
    pub fn new(config: SpreadsheetConfig) -> Self {
        Self { config }
    }
}

fn escape(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            c => out.push(c),
        }
    }
}

fn cell(value: &Value, out: &mut String) {
    let (kind, style, text) = match value {
        Value::Null => {
            out.push_str("<Cell/>");
            return;
        }
        Value::Boolean(b) => ("Boolean", "", if *b { "1".to_string() } else { "0".to_string() }),
        Value::Integer(_) | Value::Long(_) | Value::Float(_) | Value::Double(_) => ("Number", "", value.to_string()),
        Value::Date(d) => ("DateTime", " ss:StyleID=\"date\"", d.format("%Y-%m-%dT00:00:00").to_string()),
        Value::DateTime(dt) => ("DateTime", " ss:StyleID=\"datetime\"", dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
        Value::Time(t) => ("DateTime", " ss:StyleID=\"time\"", t.format("1899-12-31T%H:%M:%S%.3f").to_string()),
        Value::String(s) => ("String", "", s.clone()),
    };
    out.push_str(&format!("<Cell{style}><Data ss:Type=\"{kind}\">"));
    escape(&text, out);
    out.push_str("</Data></Cell>");
}

impl RowEncoder for SpreadsheetEncoder {
    fn open(&mut self, out: &mut Vec<u8>) -> Result<(), StreamError> {
        let mut head = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <?mso-application progid=\"Excel.Sheet\"?>\n\
             <Workbook xmlns=\"urn:schemas-microsoft-com:office:spreadsheet\" \
             xmlns:ss=\"urn:schemas-microsoft-com:office:spreadsheet\">\n\
             <Styles>\
             <Style ss:ID=\"header\"><Font ss:Bold=\"1\"/></Style>\
             <Style ss:ID=\"date\"><NumberFormat ss:Format=\"yyyy\\-mm\\-dd\"/></Style>\
             <Style ss:ID=\"datetime\"><NumberFormat ss:Format=\"yyyy\\-mm\\-dd\\ hh:mm:ss\"/></Style>\
             <Style ss:ID=\"time\"><NumberFormat ss:Format=\"hh:mm:ss\"/></Style>\
             </Styles>\n<Worksheet ss:Name=\"",
        );
        escape(&self.config.sheet_name, &mut head);
        head.push_str("\"><Table>\n");
        out.extend_from_slice(head.as_bytes());
        Ok(())
    }

    fn header(&mut self, columns: &[Column], out: &mut Vec<u8>) -> Result<(), StreamError> {
        if !self.config.header {
            return Ok(());
        }
        let mut line = String::from("<Row ss:StyleID=\"header\">");
        for column in columns {
            line.push_str("<Cell><Data ss:Type=\"String\">");
            escape(&column.name, &mut line);
            line.push_str("</Data></Cell>");
        }
        line.push_str("</Row>\n");
        out.extend_from_slice(line.as_bytes());
        Ok(())
    }

    fn row(&mut self, columns: &[Column], row: &Row, out: &mut Vec<u8>) -> Result<(), StreamError> {
        let mut line = String::from("<Row>");
        for column in columns {
            match row.get(&column.name) {
                Some(value) => cell(value, &mut line),
                None => line.push_str("<Cell/>"),
            }
        }
        line.push_str("</Row>\n");
        out.extend_from_slice(line.as_bytes());
        Ok(())
    }

    fn close(&mut self, _row_count: u64, out: &mut Vec<u8>) -> Result<(), StreamError> {
        out.extend_from_slice(b"</Table></Worksheet>\n</Workbook>\n");
        Ok(())
    }
}
