//! Separator-page detection and splitting of multi-document scans.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use lopdf::Document;

use crate::error::{Error, Result};

pub const PDF_MIME: &str = "application/pdf";
pub const TIFF_MIME: &str = "image/tiff";

/// Detects separator pages and splits files at them.
pub trait BarcodeReader: Send + Sync {
    /// Whether `mime_type` can be scanned at all.
    fn supported(&self, mime_type: &str) -> bool;

    /// Whether `mime_type` must go through
    /// [`convert_to_scannable`](BarcodeReader::convert_to_scannable) first.
    fn needs_conversion(&self, mime_type: &str) -> bool;

    /// Produce a scannable temporary copy of `path`. The caller owns and
    /// removes the returned file.
    fn convert_to_scannable(&self, path: &Path) -> Result<PathBuf>;

    /// Zero-based indexes of separator pages, in ascending order.
    fn detect(&self, path: &Path) -> Result<Vec<usize>>;

    /// One blob per sub-document, separator pages excluded.
    fn split(&self, path: &Path, separators: &[usize]) -> Result<Vec<Vec<u8>>>;
}

/// Group the pages of a `page_count`-page document into runs between
/// separators. Separator pages are dropped, and so are runs left empty by
/// leading, trailing or adjacent separators.
pub fn partition_pages(page_count: usize, separators: &[usize]) -> Vec<Vec<usize>> {
    let mut parts = Vec::new();
    let mut current = Vec::new();
    for page in 0..page_count {
        if separators.contains(&page) {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
        } else {
            current.push(page);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Split the PDF at `path` into one PDF per page run.
pub fn split_pdf(path: &Path, separators: &[usize]) -> Result<Vec<Vec<u8>>> {
    let source = Document::load(path)?;
    let pages: Vec<u32> = source.get_pages().keys().copied().collect();

    let mut blobs = Vec::new();
    for part in partition_pages(pages.len(), separators) {
        let keep: Vec<u32> = part.iter().map(|i| pages[*i]).collect();
        let drop: Vec<u32> = pages
            .iter()
            .copied()
            .filter(|p| !keep.contains(p))
            .collect();

        let mut doc = source.clone();
        doc.delete_pages(&drop);
        doc.prune_objects();

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)?;
        tracing::debug!(
            pages = keep.len(),
            bytes = bytes.len(),
            "created split document"
        );
        blobs.push(bytes);
    }
    Ok(blobs)
}

/// Write `blob` into the intake directory. With a name the file lands at
/// `<target_dir>/<name>`; without one it gets a fresh unique `.pdf` name.
pub fn write_to_intake(
    blob: &[u8],
    name: Option<&str>,
    target_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(target_dir)?;
    match name {
        Some(name) => {
            let dest = target_dir.join(name);
            std::fs::write(&dest, blob)?;
            Ok(dest)
        }
        None => {
            let mut file = tempfile::Builder::new()
                .prefix("split-")
                .suffix(".pdf")
                .tempfile_in(target_dir)?;
            file.write_all(blob)?;
            let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
            Ok(path)
        }
    }
}

/// MIME type guessed from the file extension.
pub fn file_mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Reader for PDFs whose separator pages carry the barcode string in their
/// text layer.
#[derive(Debug, Clone)]
pub struct PdfBarcodeReader {
    barcode_string: String,
}

impl PdfBarcodeReader {
    pub fn new(barcode_string: impl Into<String>) -> Self {
        Self {
            barcode_string: barcode_string.into(),
        }
    }
}

impl BarcodeReader for PdfBarcodeReader {
    fn supported(&self, mime_type: &str) -> bool {
        mime_type == PDF_MIME
    }

    fn needs_conversion(&self, _mime_type: &str) -> bool {
        false
    }

    fn convert_to_scannable(&self, path: &Path) -> Result<PathBuf> {
        Err(Error::Barcode(format!(
            "no converter available for {}",
            path.display()
        )))
    }

    fn detect(&self, path: &Path) -> Result<Vec<usize>> {
        let doc = Document::load(path)?;
        let mut page_texts = Vec::new();
        for page in doc.get_pages().keys() {
            // Pages without a usable text layer can't be separators.
            let text = doc.extract_text(&[*page]).unwrap_or_default();
            page_texts.push(text);
        }
        Ok(pages_with_marker(&page_texts, &self.barcode_string))
    }

    fn split(&self, path: &Path, separators: &[usize]) -> Result<Vec<Vec<u8>>> {
        split_pdf(path, separators)
    }
}

fn pages_with_marker(page_texts: &[String], marker: &str) -> Vec<usize> {
    page_texts
        .iter()
        .enumerate()
        .filter(|(_, text)| {
            text.split_whitespace().any(|word| word == marker)
        })
        .map(|(i, _)| i)
        .collect()
}
