//! Overlapping fixed-window text chunker.
//!
//! Splits a [`Document`]'s text into [`Chunk`]s of at most `max_chars`
//! characters. Consecutive chunks share exactly `overlap` characters so that
//! a sentence straddling a boundary is fully contained in at least one
//! chunk. Lengths are counted in Unicode scalar values; a window never
//! splits a code point.
//!
//! # Algorithm
//!
//! 1. Start the first window at character 0.
//! 2. Take `max_chars` characters (or whatever remains).
//! 3. If the window reached the end of the text, stop.
//! 4. Otherwise start the next window `overlap` characters before the end
//!    of the current one, i.e. advance by `max_chars - overlap`.
//!
//! Dropping the first `overlap` characters of every chunk after the first
//! and concatenating reconstructs the source text exactly.
//!
//! Each chunk is keyed `"{source}#{index}"` so that re-ingesting the same
//! document overwrites its previous vectors, and carries a SHA-256 hash of
//! its text.
//!
//! # Example
//!
//! ```rust
//! use ask_docs::chunk::chunk_document;
//! use ask_docs::models::Document;
//!
//! let doc = Document { source: "a.txt".into(), text: "abcdefghij".into(), url: None };
//! let chunks = chunk_document(&doc, 4, 1);
//! let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
//! assert_eq!(texts, ["abcd", "defg", "ghij"]);
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, Document};

/// Split a document into overlapping chunks.
///
/// Returns no chunks for empty text and exactly one chunk for text of at
/// most `max_chars` characters. Callers must ensure `overlap < max_chars`;
/// configuration validation enforces this for configured values.
pub fn chunk_document(doc: &Document, max_chars: usize, overlap: usize) -> Vec<Chunk> {
    debug_assert!(overlap < max_chars, "overlap must be smaller than max_chars");

    // Byte offset of every character, plus the end of the text.
    let bounds: Vec<usize> = doc
        .text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(doc.text.len()))
        .collect();
    let n = bounds.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < n {
        let end = (start + max_chars).min(n);
        let text = &doc.text[bounds[start]..bounds[end]];
        chunks.push(make_chunk(doc, chunks.len(), text));
        if end == n {
            break;
        }
        // Always make progress, even for a degenerate overlap.
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

fn make_chunk(doc: &Document, index: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Chunk::key(&doc.source, index),
        source: doc.source.clone(),
        chunk_index: index,
        text: text.to_string(),
        hash,
        url: doc.url.clone(),
    }
}
