//! Repair of documents whose archive rendition or thumbnail is out of line
//! with their record, driven by the sanity check.

use std::collections::BTreeSet;

use crate::{
    archive_store::{ArchiveStore, ArtifactRole},
    archiver::{self, Regenerated},
    document::{DocumentRecord, checksum_file},
    document_db::DocumentDb,
    error::Result,
    parsers::ParserRegistry,
    sanity::check_sanity,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Documents fixed by moving a staged artifact into place.
    pub rolled_forward: usize,
    /// Documents fixed by regenerating the archive.
    pub regenerated: usize,
    pub failed: usize,
    /// Stale staged files deleted.
    pub discarded: usize,
}

impl std::fmt::Display for RepairReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rolled forward, {} regenerated, {} failed, {} stale staged file(s) removed",
            self.rolled_forward, self.regenerated, self.failed, self.discarded
        )
    }
}

pub fn repair_archives(
    db: &DocumentDb,
    store: &ArchiveStore,
    parsers: &ParserRegistry,
) -> Result<RepairReport> {
    let affected: BTreeSet<u64> = check_sanity(db, store)?
        .iter()
        .filter(|m| m.issue.is_archive_issue())
        .filter_map(|m| m.doc_id)
        .collect();

    let mut report = RepairReport::default();
    for id in affected {
        let Some(doc) = db.get_document(id)? else {
            continue;
        };

        {
            let _lock = store.lock()?;
            roll_forward(store, &doc)?;
        }
        if artifacts_intact(store, &doc) {
            tracing::info!(doc_id = id, "rolled staged files forward");
            report.rolled_forward += 1;
            continue;
        }

        if doc.archive_filename.is_some() != doc.archive_checksum.is_some() {
            db.update_document(id, |d| {
                d.archive_filename = None;
                d.archive_checksum = None;
            })?;
        }

        match archiver::regenerate(db, store, parsers, id) {
            Ok(Regenerated::Updated(_)) => {
                tracing::info!(doc_id = id, "regenerated archive");
                report.regenerated += 1;
            }
            Ok(Regenerated::NoParser(doc)) => {
                tracing::warn!(
                    doc_id = id,
                    mime_type = %doc.mime_type,
                    "cannot repair archive: no parser for this type"
                );
                report.failed += 1;
            }
            Err(e) => {
                tracing::error!(doc_id = id, error = %e, "failed to repair archive");
                report.failed += 1;
            }
        }
    }

    // Whatever is still staged belongs to an attempt that never committed.
    let _lock = store.lock()?;
    for staged in store.list_staged_files()? {
        std::fs::remove_file(&staged)?;
        tracing::debug!(path = %staged.display(), "removed stale staged file");
        report.discarded += 1;
    }

    Ok(report)
}

/// Move staged artifacts that match `doc` into their final place. Caller
/// holds the media lock.
fn roll_forward(store: &ArchiveStore, doc: &DocumentRecord) -> Result<()> {
    if let (Some(name), Some(expected)) = (&doc.archive_filename, &doc.archive_checksum)
        && let Some(staged) = store.staged_artifact(doc.id, ArtifactRole::Archive)?
        && checksum_file(&staged)? == *expected
    {
        store.install(&staged, &store.archive_dir().join(name))?;
    }

    if let Some(name) = &doc.thumbnail_filename
        && let Some(staged) = store.staged_artifact(doc.id, ArtifactRole::Thumbnail)?
    {
        store.install(&staged, &store.thumbnail_dir().join(name))?;
    }
    Ok(())
}

fn artifacts_intact(store: &ArchiveStore, doc: &DocumentRecord) -> bool {
    let thumbnail_ok = store.thumbnail_path(doc).is_some_and(|p| p.is_file());
    let archive_ok = match (store.archive_path(doc), &doc.archive_checksum) {
        (None, None) => true,
        (Some(path), Some(expected)) => checksum_file(&path)
            .map(|checksum| checksum == *expected)
            .unwrap_or(false),
        _ => false,
    };
    thumbnail_ok && archive_ok
}
