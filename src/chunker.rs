//! Chunking policy: cuts parsed text into token-bounded chunks and attaches
//! the extraction parameters that let any later process reconstruct the
//! chunk's source span. See `SPEC_FULL.md` §5 / spec.md §4.4.

use crate::extraction::ExtractionParams;
use crate::types::{Chunk, SemanticMetadata};

#[derive(Debug, Clone, Copy)]
pub struct ChunkingPolicy {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_percent: f64,
    pub preserve_sentences: bool,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self { min_tokens: 200, max_tokens: 500, overlap_percent: 0.10, preserve_sentences: true }
    }
}

impl ChunkingPolicy {
    /// Dense formats (spreadsheets, presentations) double both bounds.
    pub fn doubled(self) -> Self {
        Self { min_tokens: self.min_tokens * 2, max_tokens: self.max_tokens * 2, ..self }
    }
}

/// `ceil(words * 1.3)`, spec.md's token-count estimator.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    ((words as f64) * 1.3).ceil() as usize
}

/// A single paragraph with its byte offsets in the original text.
struct Paragraph<'a> {
    text: &'a str,
    start: usize,
    end: usize,
}

fn split_paragraphs(text: &str) -> Vec<Paragraph<'_>> {
    let mut paragraphs = Vec::new();
    let mut pos = 0usize;
    for part in text.split("\n\n") {
        let start = pos;
        let end = start + part.len();
        if !part.trim().is_empty() {
            paragraphs.push(Paragraph { text: part, start, end });
        }
        pos = end + 2; // account for the "\n\n" separator consumed by split
    }
    paragraphs
}

/// Snap an overlap length forward to the nearest sentence boundary
/// (`. `, `! `, `? `, or a literal newline) at or after `min_len`, falling
/// back to `min_len` if none is found before the end of `text`.
fn snap_to_sentence_boundary(text: &str, min_len: usize) -> usize {
    if min_len >= text.len() {
        return text.len();
    }
    let bytes = text.as_bytes();
    let mut i = min_len;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            return i + 1;
        }
        if matches!(bytes[i], b'.' | b'!' | b'?') && bytes.get(i + 1) == Some(&b' ') {
            return i + 2;
        }
        i += 1;
    }
    min_len
}

/// Build one chunk's `Chunk` record text-only (params are layered on by the
/// format-specific wrapper).
fn make_chunk(content: String, start_offset: usize, end_offset: usize, index: usize) -> Chunk {
    let token_count_estimate = estimate_tokens(&content);
    Chunk {
        content,
        token_count_estimate,
        start_offset,
        end_offset,
        chunk_index: index,
        total_chunks: 0, // patched once the full set is known
        params: ExtractionParams::Text { version: 1, start_line: 1, end_line: 1 },
        semantic: SemanticMetadata::default(),
    }
}

/// Generic paragraph-boundary chunker shared by the text/markdown/pdf/word
/// formats. Greedily accumulates paragraphs up to `max_tokens`, then seeds
/// the next chunk with an overlap tail snapped to a sentence boundary.
/// Returns chunks with placeholder `Text` params and `total_chunks` filled
/// in; callers attach format-specific `ExtractionParams`.
pub fn chunk_text(text: &str, policy: ChunkingPolicy) -> Vec<Chunk> {
    let paragraphs = split_paragraphs(text);
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut para_idx = 0usize;
    let mut overlap_prefix = String::new();
    let mut chunk_start_override: Option<usize> = None;

    while para_idx < paragraphs.len() {
        let chunk_start = chunk_start_override.take().unwrap_or(paragraphs[para_idx].start);
        let mut content = overlap_prefix.clone();
        overlap_prefix.clear();
        if !content.is_empty() {
            content.push_str("\n\n");
        }
        content.push_str(paragraphs[para_idx].text);
        let mut chunk_end = paragraphs[para_idx].end;
        para_idx += 1;

        loop {
            let candidate_tokens = estimate_tokens(&content);
            if candidate_tokens >= policy.max_tokens {
                break;
            }
            let Some(next) = paragraphs.get(para_idx) else { break };
            let mut with_next = content.clone();
            with_next.push_str("\n\n");
            with_next.push_str(next.text);
            if estimate_tokens(&with_next) > policy.max_tokens && candidate_tokens >= policy.min_tokens
            {
                break;
            }
            content = with_next;
            chunk_end = next.end;
            para_idx += 1;
        }

        // Seed the overlap tail for the next chunk.
        if para_idx < paragraphs.len() {
            let overlap_len_target =
                ((content.len() as f64) * policy.overlap_percent).floor() as usize;
            if overlap_len_target > 0 {
                let tail_start = content.len().saturating_sub(overlap_len_target);
                let snap_offset = if policy.preserve_sentences {
                    snap_to_sentence_boundary(&content[tail_start..], 0)
                } else {
                    0
                };
                let snapped_start = (tail_start + snap_offset).min(content.len());
                overlap_prefix = content[snapped_start..].to_string();
            }
        }

        let index = chunks.len();
        chunks.push(make_chunk(content, chunk_start, chunk_end, index));
    }

    merge_undersized_tail(&mut chunks, policy);
    set_overlap_flag_and_total(&mut chunks);
    set_text_params(text, &mut chunks);
    chunks
}

fn merge_undersized_tail(chunks: &mut Vec<Chunk>, policy: ChunkingPolicy) {
    if chunks.len() < 2 {
        return;
    }
    let last = chunks.last().unwrap();
    if last.token_count_estimate >= policy.min_tokens {
        return;
    }
    let merge_cap = (policy.max_tokens as f64 * 1.2).floor() as usize;
    let prev = &chunks[chunks.len() - 2];
    let merged_tokens = prev.token_count_estimate + last.token_count_estimate;
    if merged_tokens <= merge_cap {
        let last = chunks.pop().unwrap();
        let prev = chunks.last_mut().unwrap();
        prev.content.push_str("\n\n");
        prev.content.push_str(&last.content);
        prev.end_offset = last.end_offset;
        prev.token_count_estimate = estimate_tokens(&prev.content);
    }
}

/// "non-first chunk" interpretation of the overlap flag, per the Design
/// Notes' resolution of the ambiguous source behavior. Stored as part of
/// `SemanticMetadata.topics`? No — it isn't persisted data at all, just an
/// indexing-time signal, so it's surfaced only via `chunk_index > 0` at the
/// call site rather than a stored field.
fn set_overlap_flag_and_total(chunks: &mut [Chunk]) {
    let total = chunks.len();
    for (i, c) in chunks.iter_mut().enumerate() {
        c.chunk_index = i;
        c.total_chunks = total;
    }
}

/// 1-based line number containing `byte_offset` in `text`.
fn line_number_at(text: &str, byte_offset: usize) -> u32 {
    let clamped = byte_offset.min(text.len());
    (text.as_bytes()[..clamped].iter().filter(|&&b| b == b'\n').count() as u32) + 1
}

/// Replaces each chunk's placeholder `Text` params with the real 1-based
/// line range its byte offsets span in `text`, so a client can round-trip a
/// chunk back to its source lines (spec.md §4.4, bidirectional translation).
fn set_text_params(text: &str, chunks: &mut [Chunk]) {
    for c in chunks.iter_mut() {
        let start_line = line_number_at(text, c.start_offset);
        let end_line = line_number_at(text, c.end_offset.saturating_sub(1).max(c.start_offset));
        c.params = ExtractionParams::Text { version: 1, start_line, end_line };
    }
}

// ---------------------------------------------------------------------------
// Spreadsheet-aware chunker
// ---------------------------------------------------------------------------

/// One row of a sheet: cell values in column order, `A, B, C...`.
pub struct SheetRow {
    pub cells: Vec<String>,
}

pub struct Sheet {
    pub name: String,
    pub header: SheetRow,
    pub rows: Vec<SheetRow>,
}

fn column_letter(mut idx: usize) -> String {
    // idx is 0-based; produce A, B, ..., Z, AA, AB, ...
    let mut s = Vec::new();
    idx += 1;
    while idx > 0 {
        let rem = (idx - 1) % 26;
        s.push((b'A' + rem as u8) as char);
        idx = (idx - 1) / 26;
    }
    s.iter().rev().collect()
}

fn row_to_csv(row: &SheetRow) -> String {
    row.cells.join(",")
}

/// Chunks respect sheet boundaries, always include the header row, and pack
/// rows up to `maxTokens` or 50 rows, whichever comes first.
pub fn chunk_spreadsheet(sheets: &[Sheet], policy: ChunkingPolicy) -> Vec<Chunk> {
    const MAX_ROWS_PER_CHUNK: usize = 50;
    let policy = policy.doubled();
    let mut chunks = Vec::new();

    for sheet in sheets {
        let header_csv = row_to_csv(&sheet.header);
        let mut current_rows: Vec<&SheetRow> = Vec::new();
        let mut current_row_range: Option<(u32, u32)> = None;

        let flush = |chunks: &mut Vec<Chunk>,
                     rows: &mut Vec<&SheetRow>,
                     range: &mut Option<(u32, u32)>| {
            if rows.is_empty() {
                return;
            }
            let mut content = header_csv.clone();
            for r in rows.iter() {
                content.push('\n');
                content.push_str(&row_to_csv(r));
            }
            let (start_row, end_row) = range.take().unwrap();
            let end_col_idx = sheet.header.cells.len().max(1) - 1;
            let index = chunks.len();
            let mut chunk = make_chunk(content, 0, 0, index);
            chunk.params = ExtractionParams::Excel {
                version: 1,
                sheet: sheet.name.clone(),
                start_row,
                end_row,
                start_col: column_letter(0),
                end_col: column_letter(end_col_idx),
            };
            chunks.push(chunk);
            rows.clear();
        };

        for (row_offset, row) in sheet.rows.iter().enumerate() {
            let row_number = (row_offset as u32) + 2; // header occupies row 1
            current_rows.push(row);
            current_row_range = Some(match current_row_range {
                None => (row_number, row_number),
                Some((start, _)) => (start, row_number),
            });

            let mut probe = header_csv.clone();
            for r in &current_rows {
                probe.push('\n');
                probe.push_str(&row_to_csv(r));
            }
            let over_tokens = estimate_tokens(&probe) > policy.max_tokens;
            let over_rows = current_rows.len() >= MAX_ROWS_PER_CHUNK;
            if over_tokens || over_rows {
                flush(&mut chunks, &mut current_rows, &mut current_row_range);
            }
        }
        flush(&mut chunks, &mut current_rows, &mut current_row_range);
    }

    set_overlap_flag_and_total(&mut chunks);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_matches_formula() {
        assert_eq!(estimate_tokens("one two three four"), 6); // ceil(4*1.3)
    }

    #[test]
    fn single_short_paragraph_produces_one_chunk() {
        let text = "Hello world, this is a short document.";
        let chunks = chunk_text(text, ChunkingPolicy::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total_chunks, 1);
    }

    #[test]
    fn long_document_splits_and_respects_end_offset_invariant() {
        let para = "Lorem ipsum dolor sit amet consectetur adipiscing elit sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. ".repeat(6);
        let mut text = String::new();
        for _ in 0..10 {
            text.push_str(&para);
            text.push_str("\n\n");
        }
        let chunks = chunk_text(&text, ChunkingPolicy::default());
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.end_offset > c.start_offset);
        }
    }

    #[test]
    fn spreadsheet_chunks_include_header_every_chunk() {
        let sheet = Sheet {
            name: "Sheet1".into(),
            header: SheetRow { cells: vec!["id".into(), "name".into()] },
            rows: (0..120)
                .map(|i| SheetRow { cells: vec![i.to_string(), format!("row-{i}")] })
                .collect(),
        };
        let chunks = chunk_spreadsheet(&[sheet], ChunkingPolicy::default());
        assert!(chunks.len() >= 3); // 120 rows / 50-per-chunk cap
        for c in &chunks {
            assert!(c.content.starts_with("id,name"));
        }
    }

    #[test]
    fn text_chunk_params_carry_real_line_ranges() {
        let text = "line one\nline two\nline three\nline four\n";
        let chunks = chunk_text(text, ChunkingPolicy::default());
        assert_eq!(chunks.len(), 1);
        match chunks[0].params {
            ExtractionParams::Text { start_line, end_line, .. } => {
                assert_eq!(start_line, 1);
                assert_eq!(end_line, 4);
            }
            ref other => panic!("expected Text params, got {other:?}"),
        }
    }

    #[test]
    fn spreadsheet_chunk_params_are_excel_variant() {
        let sheet = Sheet {
            name: "Data".into(),
            header: SheetRow { cells: vec!["a".into()] },
            rows: (0..5).map(|i| SheetRow { cells: vec![i.to_string()] }).collect(),
        };
        let chunks = chunk_spreadsheet(&[sheet], ChunkingPolicy::default());
        assert_eq!(chunks.len(), 1);
        match &chunks[0].params {
            ExtractionParams::Excel { sheet, start_row, end_row, .. } => {
                assert_eq!(sheet, "Data");
                assert_eq!(*start_row, 2);
                assert_eq!(*end_row, 6);
            }
            other => panic!("expected Excel params, got {other:?}"),
        }
    }
}
