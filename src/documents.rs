//! Directory document loader.
//!
//! Walks a document root, keeps files matching the include globs and not
//! matching the exclude globs, extracts their text, and attaches a citation
//! URL when `documents.citation_base_url` is configured. Unreadable files
//! are logged and skipped. Results are sorted by source identifier.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::DocumentsConfig;
use crate::extract::extract_file;
use crate::models::Document;

/// Load every matching document under `root`.
pub fn load_documents(root: &Path, config: &DocumentsConfig) -> Result<Vec<Document>> {
    if !root.is_dir() {
        bail!("Document directory does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string()];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut docs = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let source = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&source) || !include_set.is_match(&source) {
            continue;
        }

        let text = match extract_file(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("skipping {}: {}", source, e);
                continue;
            }
        };

        docs.push(Document {
            url: citation_url(config.citation_base_url.as_deref(), &source),
            source,
            text,
        });
    }

    docs.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(docs)
}

/// Join a citation base URL and a source identifier.
pub fn citation_url(base_url: Option<&str>, source: &str) -> Option<String> {
    base_url
        .filter(|b| !b.is_empty())
        .map(|b| format!("{}/{}", b.trim_end_matches('/'), source))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
