//! Per-page text extraction for uploaded documents.
//!
//! Uploads arrive as bytes plus a declared content type. PDFs go through
//! `pdf-extract` one page at a time; plain text is split into pages on form
//! feed (`\x0c`). The page list is what the chunker indexes, so page numbers
//! in citations are 1-based indexes into it.

use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";

const PAGE_BREAK: char = '\x0c';

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("text upload is not valid UTF-8")]
    InvalidText,
    #[error("document contains no extractable text")]
    NoText,
}

/// Settle the content type of an upload. Magic bytes win over a missing or
/// generic declared type; a `.txt`/`.md` filename implies plain text.
pub fn detect_content_type(declared: Option<&str>, filename: Option<&str>, bytes: &[u8]) -> String {
    let declared = declared
        .map(|d| d.split(';').next().unwrap_or(d).trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty() && d != "application/octet-stream");
    if let Some(d) = declared {
        return d;
    }
    if bytes.starts_with(b"%PDF") {
        return MIME_PDF.to_string();
    }
    let lower = filename.unwrap_or_default().to_ascii_lowercase();
    if lower.ends_with(".pdf") {
        MIME_PDF.to_string()
    } else {
        MIME_TEXT.to_string()
    }
}

/// Extract the text of every page. Empty pages are kept so numbering stays
/// aligned with the source.
pub fn extract_pages(bytes: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError> {
    let pages = match content_type {
        MIME_PDF => extract_pdf_pages(bytes)?,
        t if t.starts_with("text/") => extract_text_pages(bytes)?,
        other => return Err(ExtractError::UnsupportedContentType(other.to_string())),
    };
    if pages.iter().all(|p| p.trim().is_empty()) {
        return Err(ExtractError::NoText);
    }
    Ok(pages)
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    // pdf-extract panics on some malformed inputs.
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(bytes)
    }))
    .map_err(|_| ExtractError::Pdf("malformed PDF".to_string()))?
    .map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_text_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::InvalidText)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    Ok(text
        .replace("\r\n", "\n")
        .split(PAGE_BREAK)
        .map(|p| p.to_string())
        .collect())
}
