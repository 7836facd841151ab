//! Text extraction for document files.
//!
//! PDF files go through `pdf-extract`; every other file is read as UTF-8,
//! replacing invalid sequences. Extraction never panics: failures are
//! returned and the loader skips the file.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
}

/// Extract plain text from a file, dispatching on its extension.
pub fn extract_file(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path)?;
    if is_pdf(path) {
        extract_pdf(&bytes)
    } else {
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}
