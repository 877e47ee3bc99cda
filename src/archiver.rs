//! Regeneration of archive renditions, thumbnails and content for existing
//! documents.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::{
    archive_store::{ArchiveStore, ArtifactRole, extension_of},
    document::{DocumentRecord, checksum_file},
    document_db::DocumentDb,
    error::Result,
    parsers::{DocumentParser, ParserRegistry},
};

/// Result of a regeneration attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Regenerated {
    /// No parser handles the document's MIME type. Nothing was changed.
    NoParser(DocumentRecord),
    Updated(DocumentRecord),
}

/// Derived files produced by a parser run, still in the parser's scratch
/// space.
#[derive(Debug)]
pub struct ParsedArtifacts {
    pub content: String,
    pub archive: Option<(PathBuf, String)>,
    pub thumbnail: PathBuf,
}

/// Run `parser` over `source` and checksum the archive rendition.
pub fn parse_artifacts(
    parser: &mut dyn DocumentParser,
    source: &Path,
    mime_type: &str,
    file_name: Option<&str>,
) -> Result<ParsedArtifacts> {
    parser.parse(source, mime_type, file_name)?;
    let thumbnail = parser.thumbnail(source, mime_type, file_name)?;
    let content = parser.text().unwrap_or_default().to_string();
    let archive = match parser.archive_path() {
        Some(path) => Some((path.to_path_buf(), checksum_file(path)?)),
        None => None,
    };
    Ok(ParsedArtifacts {
        content,
        archive,
        thumbnail,
    })
}

/// Stage `artifacts` for `doc`, commit the record update and move the staged
/// files into place, all under the media lock.
///
/// The record is committed before any file is renamed. If a rename fails,
/// the previous archive fields are written back so the record never points
/// at a file that was not installed; leftover staged files are picked up
/// by [`repair`](crate::repair).
pub fn install_artifacts(
    db: &DocumentDb,
    store: &ArchiveStore,
    doc: &DocumentRecord,
    artifacts: ParsedArtifacts,
) -> Result<DocumentRecord> {
    let _lock = store.lock()?;
    // Names are chosen against the record as it is under the lock.
    let previous = db.require_document(doc.id)?;

    let thumbnail_name = format!(
        "{}.{}",
        doc.file_stem(),
        extension_of(&artifacts.thumbnail).unwrap_or("png")
    );
    let staged_thumbnail =
        store.stage(doc.id, ArtifactRole::Thumbnail, &artifacts.thumbnail)?;

    let staged_archive = match &artifacts.archive {
        Some((path, checksum)) => {
            let name = store.unique_archive_filename(
                &previous,
                extension_of(path).unwrap_or("pdf"),
            );
            let staged = store.stage(doc.id, ArtifactRole::Archive, path)?;
            Some((staged, name, checksum.clone()))
        }
        None => None,
    };

    let updated = db.update_document(doc.id, |d| {
        d.content = artifacts.content.clone();
        d.thumbnail_filename = Some(thumbnail_name.clone());
        if let Some((_, name, checksum)) = &staged_archive {
            d.archive_filename = Some(name.clone());
            d.archive_checksum = Some(checksum.clone());
        }
        d.modified = Utc::now();
    })?;

    let installed = store
        .install(&staged_thumbnail, &store.thumbnail_dir().join(&thumbnail_name))
        .and_then(|()| match &staged_archive {
            Some((staged, name, _)) => {
                store.install(staged, &store.archive_dir().join(name))
            }
            None => Ok(()),
        });

    if let Err(e) = installed {
        tracing::error!(
            doc_id = doc.id,
            error = %e,
            "failed to move regenerated files into place, restoring record"
        );
        db.update_document(doc.id, |d| {
            d.archive_filename = previous.archive_filename.clone();
            d.archive_checksum = previous.archive_checksum.clone();
            d.thumbnail_filename = previous.thumbnail_filename.clone();
            d.content = previous.content.clone();
            d.modified = previous.modified;
        })?;
        return Err(e);
    }

    if let (Some(old), Some(new)) =
        (&previous.archive_filename, &updated.archive_filename)
        && old != new
    {
        let superseded = store.archive_dir().join(old);
        if let Err(e) = std::fs::remove_file(&superseded) {
            tracing::warn!(
                path = %superseded.display(),
                error = %e,
                "failed to remove superseded archive file"
            );
        }
    }

    Ok(updated)
}

/// Re-parse the original of document `doc_id` and replace its content,
/// thumbnail and archive rendition.
///
/// A missing record is an error. A missing parser is reported as
/// [`Regenerated::NoParser`] and leaves everything untouched.
pub fn regenerate(
    db: &DocumentDb,
    store: &ArchiveStore,
    parsers: &ParserRegistry,
    doc_id: u64,
) -> Result<Regenerated> {
    let doc = db.require_document(doc_id)?;
    let Some(mut parser) = parsers.parser_for(&doc.mime_type) else {
        return Ok(Regenerated::NoParser(doc));
    };

    let source = store.source_path(&doc);
    let artifacts = parse_artifacts(
        &mut *parser,
        &source,
        &doc.mime_type,
        Some(&doc.original_filename),
    )?;
    let updated = install_artifacts(db, store, &doc, artifacts)?;

    tracing::debug!(
        doc_id,
        archive = updated.archive_filename.as_deref().unwrap_or("-"),
        "archive regenerated"
    );
    Ok(Regenerated::Updated(updated))
}
