use anyhow::{Context, Result};
use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Reader};
use serde_json::json;
use std::path::Path;

use super::{FileParser, ParsedFile};

const ACCEPTED: &[&str] = &[
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// Excel parser. Every sheet is rendered as one markdown table so downstream
/// chunking keeps rows intact.
pub struct SpreadsheetParser;

impl SpreadsheetParser {
    pub fn new() -> Self {
        Self
    }

    fn cell_to_string(cell: &Data) -> String {
        match cell {
            Data::Empty => String::new(),
            Data::String(s) => s.replace('|', "\\|"),
            Data::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", *f as i64)
                } else {
                    format!("{}", f)
                }
            }
            Data::Int(i) => i.to_string(),
            Data::Bool(b) => b.to_string(),
            Data::DateTime(dt) => dt.as_f64().to_string(),
            Data::DateTimeIso(s) => s.clone(),
            Data::DurationIso(s) => s.clone(),
            Data::Error(e) => format!("#ERR:{:?}", e),
        }
    }

    fn render_sheet(name: &str, rows: &[Vec<String>]) -> String {
        let mut out = format!("## {}\n\n", name);
        if rows.is_empty() {
            out.push_str("(empty sheet)\n");
            return out;
        }

        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        for (i, row) in rows.iter().enumerate() {
            let mut padded = row.clone();
            padded.resize(width, String::new());
            out.push_str(&format!("| {} |\n", padded.join(" | ")));
            if i == 0 {
                out.push_str(&format!("|{}\n", " --- |".repeat(width)));
            }
        }
        out
    }

    fn parse_workbook(path: &Path) -> Result<ParsedFile> {
        let mut workbook = open_workbook_auto(path).context("failed to open workbook")?;
        let sheet_names = workbook.sheet_names().to_vec();

        let mut content = String::new();
        let mut sheet_meta = Vec::new();

        for name in &sheet_names {
            let range = match workbook.worksheet_range(name) {
                Ok(range) => range,
                Err(e) => {
                    sheet_meta.push(json!({"name": name, "error": e.to_string()}));
                    continue;
                }
            };

            let rows: Vec<Vec<String>> = range
                .rows()
                .map(|row| row.iter().map(Self::cell_to_string).collect())
                .collect();

            let columns = rows.iter().map(|r| r.len()).max().unwrap_or(0);
            sheet_meta.push(json!({
                "name": name,
                "rows": rows.len(),
                "columns": columns,
            }));

            content.push_str(&Self::render_sheet(name, &rows));
            content.push('\n');
        }

        let mut parsed = ParsedFile::with_content(content);
        parsed.page_count = Some(sheet_names.len());
        parsed
            .metadata
            .insert("sheets".to_string(), json!(sheet_meta));
        Ok(parsed)
    }
}

#[async_trait]
impl FileParser for SpreadsheetParser {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    fn can_parse(&self, content_type: &str) -> bool {
        ACCEPTED.contains(&content_type)
    }

    async fn parse(&self, path: &Path) -> Result<ParsedFile> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::parse_workbook(&path)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_markdown_table_with_header_separator() {
        let rows = vec![
            vec!["name".to_string(), "qty".to_string()],
            vec!["bolts".to_string(), "40".to_string()],
        ];
        let rendered = SpreadsheetParser::render_sheet("inventory", &rows);
        assert!(rendered.starts_with("## inventory"));
        assert!(rendered.contains("| name | qty |"));
        assert!(rendered.contains("| --- | --- |"));
        assert!(rendered.contains("| bolts | 40 |"));
    }

    #[test]
    fn integer_floats_render_without_fraction() {
        assert_eq!(SpreadsheetParser::cell_to_string(&Data::Float(40.0)), "40");
        assert_eq!(SpreadsheetParser::cell_to_string(&Data::Float(1.5)), "1.5");
    }

    #[test]
    fn pipes_in_cells_are_escaped() {
        let cell = Data::String("a|b".to_string());
        assert_eq!(SpreadsheetParser::cell_to_string(&cell), "a\\|b");
    }
}
