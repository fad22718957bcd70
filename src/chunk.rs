//! Overlapping window chunker.
//!
//! Splits document text into [`DocumentChunk`]s of at most `max_chars`
//! characters. Splitting prefers paragraph boundaries (`\n\n`), then line
//! breaks, then spaces, and only cuts inside a word when a single word is
//! longer than the window. Consecutive chunks share up to `overlap_chars`
//! characters of trailing context so a query can match text that straddles
//! a boundary.
//!
//! Lengths are counted in `char`s, never bytes, so multi-byte text is never
//! split inside a code point.

use crate::models::{Document, DocumentChunk};

/// Separators tried in order, coarsest first.
const SEPARATORS: &[&str] = &["\n\n", "\n", " "];

/// A piece of text together with the separator that preceded it in the
/// source, so windows can be re-joined faithfully.
#[derive(Debug, Clone)]
struct Piece<'a> {
    text: &'a str,
    sep: &'static str,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split a document into overlapping chunks with contiguous indices from 0.
///
/// Whitespace-only documents produce no chunks.
pub fn chunk_document(doc: &Document, max_chars: usize, overlap_chars: usize) -> Vec<DocumentChunk> {
    chunk_text(&doc.content, max_chars, overlap_chars)
        .into_iter()
        .enumerate()
        .map(|(i, content)| DocumentChunk {
            content,
            source_path: doc.source_path.clone(),
            chunk_index: i as i64,
        })
        .collect()
}

/// Split raw text into overlapping windows.
pub fn chunk_text(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let overlap_chars = overlap_chars.min(max_chars.saturating_sub(1));

    let mut pieces = Vec::new();
    split_recursive(text, "", max_chars, 0, &mut pieces);

    let mut chunks = Vec::new();
    let mut window: Vec<Piece> = Vec::new();

    for piece in pieces {
        let piece_len = char_len(piece.text);
        let sep_len = if window.is_empty() { 0 } else { char_len(piece.sep) };

        if !window.is_empty() && joined_len(&window) + sep_len + piece_len > max_chars {
            chunks.push(join(&window));

            // Keep a tail of the previous window as overlap, as long as it
            // still leaves room for the incoming piece.
            while !window.is_empty() {
                let len = joined_len(&window);
                let fits = len + char_len(piece.sep) + piece_len <= max_chars;
                if len <= overlap_chars && fits {
                    break;
                }
                window.remove(0);
            }
        }

        window.push(piece);
    }

    if !window.is_empty() {
        chunks.push(join(&window));
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}

fn split_recursive<'a>(
    text: &'a str,
    sep: &'static str,
    max_chars: usize,
    level: usize,
    out: &mut Vec<Piece<'a>>,
) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }

    if char_len(trimmed) <= max_chars {
        out.push(Piece { text: trimmed, sep });
        return;
    }

    if let Some(next_sep) = SEPARATORS.get(level) {
        let mut first = true;
        for part in trimmed.split(next_sep) {
            // The first sub-piece inherits the separator that preceded the
            // whole span.
            let part_sep = if first { sep } else { *next_sep };
            let before = out.len();
            split_recursive(part, part_sep, max_chars, level + 1, out);
            if out.len() > before {
                first = false;
            }
        }
        return;
    }

    // No separator left: hard split on char boundaries.
    let mut start = 0;
    let mut count = 0;
    let mut first = true;
    for (idx, _) in trimmed.char_indices() {
        if count == max_chars {
            out.push(Piece {
                text: &trimmed[start..idx],
                sep: if first { sep } else { "" },
            });
            first = false;
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < trimmed.len() {
        out.push(Piece {
            text: &trimmed[start..],
            sep: if first { sep } else { "" },
        });
    }
}

fn joined_len(window: &[Piece]) -> usize {
    window
        .iter()
        .enumerate()
        .map(|(i, p)| char_len(p.text) + if i == 0 { 0 } else { char_len(p.sep) })
        .sum()
}

fn join(window: &[Piece]) -> String {
    let mut buf = String::new();
    for (i, p) in window.iter().enumerate() {
        if i > 0 {
            buf.push_str(p.sep);
        }
        buf.push_str(p.text);
    }
    buf.trim().to_string()
}
