//! Context window assembly.
//!
//! Turns ranked passages into the bounded text block placed in the prompt,
//! plus the citation list returned to the caller. Passages are never cut in
//! the middle: the first passage that would overflow the budget ends
//! assembly, and only sources of included passages are cited.

use std::collections::HashSet;

use crate::documents::citation_url;
use crate::models::{Citation, RetrievedPassage};

const SEPARATOR: &str = "\n\n";

/// The assembled context block and the sources it drew from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Number of passages included in `text`.
    pub passages: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Assemble passages (best first) into at most `max_chars` characters.
///
/// Duplicate chunk keys are dropped. Each passage renders as
/// `[source]\ntext`, joined by blank lines.
pub fn assemble(
    passages: &[RetrievedPassage],
    max_chars: usize,
    citation_base_url: Option<&str>,
) -> AssembledContext {
    let mut out = AssembledContext::default();
    let mut used = 0usize;
    let mut seen_chunks: HashSet<&str> = HashSet::new();
    let mut seen_sources: HashSet<&str> = HashSet::new();

    for passage in passages {
        let chunk = &passage.chunk;
        if !seen_chunks.insert(chunk.id.as_str()) {
            continue;
        }

        let rendered = format!("[{}]\n{}", chunk.source, chunk.text);
        let separator = if out.text.is_empty() { 0 } else { SEPARATOR.len() };
        let cost = separator + rendered.chars().count();
        if used + cost > max_chars {
            break;
        }

        if separator > 0 {
            out.text.push_str(SEPARATOR);
        }
        out.text.push_str(&rendered);
        used += cost;
        out.passages += 1;

        if seen_sources.insert(chunk.source.as_str()) {
            out.citations.push(Citation {
                source: chunk.source.clone(),
                url: chunk
                    .url
                    .clone()
                    .or_else(|| citation_url(citation_base_url, &chunk.source)),
            });
        }
    }

    out
}

/// Render citations as a Markdown `Sources:` list. Empty input renders
/// nothing.
pub fn render_sources_markdown(citations: &[Citation]) -> String {
    if citations.is_empty() {
        return String::new();
    }
    let mut out = String::from("Sources:");
    for c in citations {
        match &c.url {
            Some(url) => out.push_str(&format!("\n- [{}]({})", c.source, url)),
            None => out.push_str(&format!("\n- {}", c.source)),
        }
    }
    out
}
