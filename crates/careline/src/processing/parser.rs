use calamine::{open_workbook_auto_from_rs, Data, Reader};
use regex::Regex;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::types::DocumentFormat;

static HTML_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("html block regex is valid")
});
static HTML_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").expect("html tag regex is valid"));
static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank lines regex is valid"));

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub content: String,
    pub title: String,
    pub metadata: HashMap<String, String>,
    pub format: DocumentFormat,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentParser;

impl DocumentParser {
    pub fn new() -> Self {
        Self
    }

    /// Extract text from an uploaded file. Images and unknown formats have
    /// no text parser and return `Error::Parse`.
    pub fn parse_bytes(&self, bytes: &[u8], filename: &str) -> Result<ParsedDocument> {
        let format = DocumentFormat::from_filename(filename);
        let title = Path::new(filename)
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("untitled")
            .to_string();

        let content = match format {
            DocumentFormat::Txt | DocumentFormat::Markdown => decode_text(bytes),
            DocumentFormat::Html => strip_html_tags(&decode_text(bytes)),
            DocumentFormat::Json => self.parse_json(bytes)?,
            DocumentFormat::Csv => self.parse_csv(bytes)?,
            DocumentFormat::Spreadsheet => self.parse_spreadsheet(bytes)?,
            DocumentFormat::Pdf => self.parse_pdf(bytes)?,
            DocumentFormat::Word => self.parse_docx(bytes)?,
            DocumentFormat::Image | DocumentFormat::Unknown => {
                return Err(Error::Parse(format!("no text parser for {}", filename)))
            }
        };

        if content.trim().is_empty() {
            return Err(Error::Parse(format!("{} contains no extractable text", filename)));
        }

        let mut metadata = HashMap::new();
        metadata.insert("filename".to_string(), filename.to_string());
        metadata.insert("file_size".to_string(), bytes.len().to_string());
        metadata.insert("format".to_string(), format!("{:?}", format));

        Ok(ParsedDocument {
            content,
            title,
            metadata,
            format,
        })
    }

    fn parse_pdf(&self, bytes: &[u8]) -> Result<String> {
        // Layer 1: pdf_extract for fast text extraction. It panics on some
        // malformed streams, so the panic is contained here.
        let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes));
        if let Ok(Ok(text)) = extracted {
            let cleaned = text
                .lines()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            if !cleaned.is_empty() {
                return Ok(cleaned);
            }
        }

        // pdf_extract failed, try lopdf's content stream parsing
        let doc = lopdf::Document::load_mem(bytes)
            .map_err(|e| Error::Parse(format!("PDF could not be loaded: {}", e)))?;
        let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
        let text = doc
            .extract_text(&pages)
            .map_err(|e| Error::Parse(format!("PDF text extraction failed: {}", e)))?;
        if text.trim().is_empty() {
            return Err(Error::Parse(
                "PDF contains no extractable text (scanned/image-based)".into(),
            ));
        }
        Ok(text)
    }

    fn parse_docx(&self, bytes: &[u8]) -> Result<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| Error::Parse(format!("Failed to read DOCX as ZIP: {}", e)))?;

        let mut xml_content = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|e| Error::Parse(format!("DOCX missing word/document.xml: {}", e)))?
            .read_to_string(&mut xml_content)?;

        Ok(extract_docx_text(&xml_content))
    }

    /// Flatten a spreadsheet into text, one row per line, pipe-separated.
    fn parse_spreadsheet(&self, bytes: &[u8]) -> Result<String> {
        let sheets = read_workbook(bytes)?;
        let multi = sheets.len() > 1;
        let mut all_text = String::new();
        for (name, rows) in sheets {
            if multi {
                all_text.push_str(&format!("\n--- Sheet: {} ---\n", name));
            }
            for row in rows {
                all_text.push_str(&row.join(" | "));
                all_text.push('\n');
            }
        }
        Ok(all_text)
    }

    fn parse_csv(&self, bytes: &[u8]) -> Result<String> {
        let rows = read_csv_rows(bytes)?;
        Ok(rows
            .iter()
            .map(|r| r.join(" | "))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// JSON becomes `key: value` lines; arrays of objects become one block each.
    fn parse_json(&self, bytes: &[u8]) -> Result<String> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Parse(format!("invalid JSON: {}", e)))?;
        let mut out = String::new();
        flatten_json(&value, "", &mut out);
        Ok(out.trim().to_string())
    }
}

/// All non-empty rows of every sheet, as strings.
pub fn read_workbook(bytes: &[u8]) -> Result<Vec<(String, Vec<Vec<String>>)>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| Error::Parse(format!("Failed to open spreadsheet: {}", e)))?;

    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        return Err(Error::Parse("Spreadsheet has no sheets".into()));
    }

    let mut sheets = Vec::new();
    for sheet_name in sheet_names {
        let range = match workbook.worksheet_range(&sheet_name) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(sheet = %sheet_name, error = %e, "Skipping unreadable sheet");
                continue;
            }
        };
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
            .filter(|cells: &Vec<String>| cells.iter().any(|c| !c.is_empty()))
            .collect();
        if !rows.is_empty() {
            sheets.push((sheet_name, rows));
        }
    }
    Ok(sheets)
}

pub fn read_csv_rows(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::Parse(format!("invalid CSV: {}", e)))?;
        let cells: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
        if cells.iter().any(|c| !c.is_empty()) {
            rows.push(cells);
        }
    }
    Ok(rows)
}

fn decode_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_start_matches('\u{feff}').replace("\r\n", "\n")
}

fn flatten_json(value: &serde_json::Value, prefix: &str, out: &mut String) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() { k.clone() } else { format!("{}.{}", prefix, k) };
                flatten_json(v, &key, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_json(item, prefix, out);
                if item.is_object() {
                    out.push('\n');
                }
            }
        }
        Value::Null => {}
        Value::String(s) if prefix.is_empty() => {
            out.push_str(s);
            out.push('\n');
        }
        other => {
            let text = match other {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            if prefix.is_empty() {
                out.push_str(&text);
            } else {
                out.push_str(&format!("{}: {}", prefix, text));
            }
            out.push('\n');
        }
    }
}

pub(crate) fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Use integer display when the float is a whole number (e.g. 1500.0 -> "1500")
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                (*f as i64).to_string()
            } else {
                format!("{:.4}", f).trim_end_matches('0').trim_end_matches('.').to_string()
            }
        }
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::Error(e) => format!("#ERR:{:?}", e),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

fn strip_html_tags(html: &str) -> String {
    let without_blocks = HTML_BLOCK_RE.replace_all(html, " ");
    let with_breaks = without_blocks
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("</p>", "\n")
        .replace("</div>", "\n");
    let text = HTML_TAG_RE.replace_all(&with_breaks, "");
    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");
    let lines: Vec<&str> = decoded.lines().map(str::trim).collect();
    BLANK_LINES_RE.replace_all(&lines.join("\n"), "\n\n").trim().to_string()
}

/// Pull paragraph text out of `word/document.xml`: `<w:t>` runs joined per `<w:p>`.
fn extract_docx_text(xml: &str) -> String {
    let mut paragraphs = Vec::new();
    for para in xml.split("</w:p>") {
        let mut text = String::new();
        let mut rest = para;
        while let Some(start) = rest.find("<w:t") {
            let after = &rest[start + 4..];
            // Skip <w:tab/>, <w:tbl> and friends.
            if !(after.starts_with('>') || after.starts_with(' ')) {
                rest = after;
                continue;
            }
            let Some(open_end) = after.find('>') else { break };
            let body = &after[open_end + 1..];
            let Some(close) = body.find("</w:t>") else { break };
            text.push_str(&body[..close]);
            rest = &body[close + 6..];
        }
        if !text.is_empty() {
            paragraphs.push(text);
        }
    }
    paragraphs.join("\n")
}
