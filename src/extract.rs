//! Text extraction for the supported document kinds.
//!
//! Markdown and plain text are decoded as UTF-8 (lossy, BOM stripped).
//! PDFs go through `pdf-extract`. A document that cannot be decoded is an
//! error for the caller to log; the sync pipeline skips it and retries on
//! the next cycle.

use grounded_kb_core::models::FileKind;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
}

/// Extract plain UTF-8 text from the raw bytes of a document.
pub fn extract_text(bytes: &[u8], kind: FileKind) -> Result<String, ExtractError> {
    match kind {
        FileKind::Markdown | FileKind::Text => Ok(decode_text(bytes)),
        FileKind::Pdf => extract_pdf(bytes),
    }
}

fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).replace("\r\n", "\n")
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}
