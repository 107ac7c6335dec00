//! Bidirectional chunk translation: extraction parameters and the
//! `DocumentParser` capability seam that reconstructs a chunk's source span.
//! See `SPEC_FULL.md` §5 / spec.md §4.4 and §6.

use crate::error::{DaemonError, DaemonResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const EXTRACTION_PARAMS_VERSION: u32 = 1;

/// One tagged variant per source type. `version` lets a future schema change
/// coexist with chunks already persisted under an older one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExtractionParams {
    Text { version: u32, start_line: u32, end_line: u32 },
    Markdown { version: u32, start_line: u32, end_line: u32, section: Option<String> },
    Pdf {
        version: u32,
        page: u32,
        start_text_block: u32,
        end_text_block: u32,
        x: Option<f64>,
        y: Option<f64>,
        width: Option<f64>,
        height: Option<f64>,
    },
    Excel { version: u32, sheet: String, start_row: u32, end_row: u32, start_col: String, end_col: String },
    Powerpoint { version: u32, slide: u32, include_notes: bool, include_comments: Option<bool> },
    Word {
        version: u32,
        start_paragraph: u32,
        end_paragraph: u32,
        paragraph_types: Option<Vec<String>>,
        start_line_in_para: Option<u32>,
        end_line_in_para: Option<u32>,
        has_formatting: Option<bool>,
        heading_level: Option<u32>,
    },
}

/// `^[A-Z]{1,3}$` — spreadsheet column letters, normalized upper case.
fn is_valid_column(s: &str) -> bool {
    (1..=3).contains(&s.len()) && s.chars().all(|c| c.is_ascii_uppercase())
}

impl ExtractionParams {
    pub fn validate(&self) -> DaemonResult<()> {
        match self {
            ExtractionParams::Text { start_line, end_line, .. } => {
                require_order(*start_line, *end_line, "startLine", "endLine")?;
                require_nonzero(*start_line, "startLine")
            }
            ExtractionParams::Markdown { start_line, end_line, .. } => {
                require_order(*start_line, *end_line, "startLine", "endLine")?;
                require_nonzero(*start_line, "startLine")
            }
            ExtractionParams::Pdf { start_text_block, end_text_block, .. } => {
                require_order(*start_text_block, *end_text_block, "startTextBlock", "endTextBlock")
            }
            ExtractionParams::Excel { sheet, start_row, end_row, start_col, end_col, .. } => {
                if sheet.trim().is_empty() {
                    return Err(DaemonError::Validation("excel: sheet must not be empty".into()));
                }
                require_order(*start_row, *end_row, "startRow", "endRow")?;
                require_nonzero(*start_row, "startRow")?;
                let (sc, ec) = (start_col.to_ascii_uppercase(), end_col.to_ascii_uppercase());
                if !is_valid_column(&sc) || !is_valid_column(&ec) {
                    return Err(DaemonError::Validation(format!(
                        "excel: column letters must match ^[A-Z]{{1,3}}$, got '{start_col}'..'{end_col}'"
                    )));
                }
                Ok(())
            }
            ExtractionParams::Powerpoint { slide, .. } => require_nonzero(*slide, "slide"),
            ExtractionParams::Word { start_paragraph, end_paragraph, .. } => {
                require_order(*start_paragraph, *end_paragraph, "startParagraph", "endParagraph")
            }
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            ExtractionParams::Text { version, .. }
            | ExtractionParams::Markdown { version, .. }
            | ExtractionParams::Pdf { version, .. }
            | ExtractionParams::Excel { version, .. }
            | ExtractionParams::Powerpoint { version, .. }
            | ExtractionParams::Word { version, .. } => *version,
        }
    }
}

fn require_order(start: u32, end: u32, start_name: &str, end_name: &str) -> DaemonResult<()> {
    if start > end {
        return Err(DaemonError::Validation(format!("{start_name} ({start}) > {end_name} ({end})")));
    }
    Ok(())
}

fn require_nonzero(v: u32, name: &str) -> DaemonResult<()> {
    if v == 0 {
        return Err(DaemonError::Validation(format!("{name} must be 1-based (nonzero)")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DocumentParser — capability seam for §1 "external collaborators"
// ---------------------------------------------------------------------------

/// Parses a source file into plain text suitable for chunking, and
/// reconstructs the exact text for a chunk's extraction params (the
/// bidirectionality invariant — `extract(file, chunk.params)` must reproduce
/// what the chunker fed the embedder). Concrete format parsers (PDF, DOCX,
/// XLSX, PPTX) are out of this crate's scope per spec.md §1; only the text
/// and markdown paths are implemented directly here, since they require no
/// external parsing library.
pub trait DocumentParser: Send + Sync {
    /// Extensions this parser claims, e.g. `["txt"]`.
    fn extensions(&self) -> &[&str];

    /// Read the whole file as a single string for chunking.
    fn parse(&self, path: &Path) -> DaemonResult<String>;

    /// Re-extract the exact text a chunk with these params was cut from.
    fn extract(&self, path: &Path, params: &ExtractionParams) -> DaemonResult<String>;
}

pub struct PlainTextParser;

impl PlainTextParser {
    fn read_lines(&self, path: &Path) -> DaemonResult<Vec<String>> {
        let content = std::fs::read_to_string(path)?;
        Ok(content.lines().map(|l| l.to_string()).collect())
    }
}

impl DocumentParser for PlainTextParser {
    fn extensions(&self) -> &[&str] {
        &["txt"]
    }

    fn parse(&self, path: &Path) -> DaemonResult<String> {
        Ok(std::fs::read_to_string(path)?)
    }

    fn extract(&self, path: &Path, params: &ExtractionParams) -> DaemonResult<String> {
        match params {
            ExtractionParams::Text { start_line, end_line, .. } => {
                let lines = self.read_lines(path)?;
                Ok(slice_lines(&lines, *start_line, *end_line))
            }
            other => Err(DaemonError::Internal(format!(
                "PlainTextParser cannot extract {other:?}"
            ))),
        }
    }
}

pub struct MarkdownParser;

impl DocumentParser for MarkdownParser {
    fn extensions(&self) -> &[&str] {
        &["md"]
    }

    fn parse(&self, path: &Path) -> DaemonResult<String> {
        Ok(std::fs::read_to_string(path)?)
    }

    fn extract(&self, path: &Path, params: &ExtractionParams) -> DaemonResult<String> {
        match params {
            ExtractionParams::Markdown { start_line, end_line, .. } => {
                let content = std::fs::read_to_string(path)?;
                let lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
                Ok(slice_lines(&lines, *start_line, *end_line))
            }
            other => Err(DaemonError::Internal(format!(
                "MarkdownParser cannot extract {other:?}"
            ))),
        }
    }
}

/// 1-based, inclusive line range, out-of-range clamped rather than erroring
/// (a file shrinking between index and query is a normal race, not a bug).
fn slice_lines(lines: &[String], start_line: u32, end_line: u32) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let start = (start_line.max(1) as usize - 1).min(lines.len() - 1);
    let end = (end_line.max(1) as usize - 1).min(lines.len() - 1);
    if start > end {
        return String::new();
    }
    lines[start..=end].join("\n")
}

/// Registry of parsers keyed by lowercase extension (no leading dot).
pub struct ParserRegistry {
    parsers: Vec<Box<dyn DocumentParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self { parsers: vec![Box::new(PlainTextParser), Box::new(MarkdownParser)] }
    }

    pub fn register(&mut self, parser: Box<dyn DocumentParser>) {
        self.parsers.push(parser);
    }

    pub fn for_extension(&self, ext: &str) -> Option<&dyn DocumentParser> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.parsers.iter().find(|p| p.extensions().contains(&ext.as_str())).map(|b| b.as_ref())
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_reversed_range() {
        let p = ExtractionParams::Text { version: 1, start_line: 10, end_line: 2 };
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_based_text_line() {
        let p = ExtractionParams::Text { version: 1, start_line: 0, end_line: 2 };
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_excel_column() {
        let p = ExtractionParams::Excel {
            version: 1,
            sheet: "Sheet1".into(),
            start_row: 1,
            end_row: 5,
            start_col: "a1".into(),
            end_col: "B".into(),
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_excel() {
        let p = ExtractionParams::Excel {
            version: 1,
            sheet: "Sheet1".into(),
            start_row: 1,
            end_row: 5,
            start_col: "A".into(),
            end_col: "AB".into(),
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn round_trip_serde() {
        let p = ExtractionParams::Markdown {
            version: 1,
            start_line: 3,
            end_line: 8,
            section: Some("Intro".into()),
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: ExtractionParams = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn text_extract_round_trips_exact_span() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "one\ntwo\nthree\nfour\n").unwrap();
        let parser = PlainTextParser;
        let params = ExtractionParams::Text { version: 1, start_line: 2, end_line: 3 };
        let text = parser.extract(&file, &params).unwrap();
        assert_eq!(text, "two\nthree");
    }
}
