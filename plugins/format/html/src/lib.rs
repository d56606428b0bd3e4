use serde::Deserialize;

use query_api::{Column, Row, RowEncoder, StreamError};

pub const EXTENSION: &str = "html";
pub const MEDIA_TYPE: &str = "text/html";

const OPEN: &str = "<table class=\"qetable\"><thead>\n";
const END_HEAD: &str = "</thead><tbody>\n";
const CLOSE: &str = "</tbody></table>";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HtmlConfig {}

/// Single `<table>` with alternating row and column classes.
#[derive(Default)]
pub struct HtmlEncoder {
    row_number: u64,
}

impl HtmlEncoder {
    pub fn new(_config: HtmlConfig) -> Self {
        Self::default()
    }
}

fn parity(n: u64) -> &'static str {
    if n % 2 == 0 { "even" } else { "odd" }
}

pub fn escape(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

impl RowEncoder for HtmlEncoder {
    fn open(&mut self, out: &mut Vec<u8>) -> Result<(), StreamError> {
        out.extend_from_slice(OPEN.as_bytes());
        Ok(())
    }

    fn header(&mut self, columns: &[Column], out: &mut Vec<u8>) -> Result<(), StreamError> {
        let mut tr = String::from("<tr class=\"header\">");
        for (i, column) in columns.iter().enumerate() {
            tr.push_str(&format!("<th class=\"header {}Col\" >", parity(i as u64 + 1)));
            escape(&column.name, &mut tr);
            tr.push_str("</th>");
        }
        tr.push_str("</tr>\n");
        tr.push_str(END_HEAD);
        out.extend_from_slice(tr.as_bytes());
        Ok(())
    }

    fn row(&mut self, columns: &[Column], row: &Row, out: &mut Vec<u8>) -> Result<(), StreamError> {
        self.row_number += 1;
        let row_class = format!("{}Row", parity(self.row_number));
        let mut tr = format!("<tr class=\"dataRow {row_class}\" >");
        for (i, column) in columns.iter().enumerate() {
            tr.push_str(&format!("<td class=\"{row_class} {}Col\">", parity(i as u64 + 1)));
            if let Some(value) = row.get(&column.name) {
                escape(&value.to_string(), &mut tr);
            }
            tr.push_str("</td>");
        }
        tr.push_str("</tr>\n");
        out.extend_from_slice(tr.as_bytes());
        Ok(())
    }

    fn close(&mut self, _row_count: u64, out: &mut Vec<u8>) -> Result<(), StreamError> {
        out.extend_from_slice(CLOSE.as_bytes());
        Ok(())
    }
}
