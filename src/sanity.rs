//! Corpus-wide consistency checks between the document store and the media
//! tree.

use std::{collections::BTreeSet, path::PathBuf};

use crate::{
    archive_store::ArchiveStore,
    document::checksum_file,
    document_db::DocumentDb,
    error::{Error, Result},
};

pub const FAILED_WITH_ERRORS: &str = "Sanity check failed with errors. See log.";
pub const EXITED_WITH_WARNINGS: &str = "Sanity check exited with warnings. See log.";
pub const EXITED_WITH_INFOS: &str = "Sanity check exited with infos. See log.";
pub const NO_ISSUES: &str = "No issues detected.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// What a check found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    MissingOriginal,
    UnreadableOriginal(String),
    OriginalChecksumMismatch,
    MissingThumbnail,
    /// Exactly one of the archive filename and checksum is set.
    ArchiveFieldsInconsistent,
    MissingArchive,
    UnreadableArchive(String),
    ArchiveChecksumMismatch,
    EmptyContent,
    OrphanedFile(PathBuf),
    LeftoverStagedFile(PathBuf),
}

impl Issue {
    pub fn level(&self) -> Level {
        match self {
            Issue::EmptyContent => Level::Info,
            Issue::OrphanedFile(_) | Issue::LeftoverStagedFile(_) => Level::Warning,
            _ => Level::Error,
        }
    }

    /// Whether the archive rendition or thumbnail of a document is affected.
    pub fn is_archive_issue(&self) -> bool {
        matches!(
            self,
            Issue::MissingThumbnail
                | Issue::ArchiveFieldsInconsistent
                | Issue::MissingArchive
                | Issue::UnreadableArchive(_)
                | Issue::ArchiveChecksumMismatch
        )
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Issue::MissingOriginal => write!(f, "Original of document does not exist."),
            Issue::UnreadableOriginal(e) => {
                write!(f, "Cannot read original file of document: {e}")
            }
            Issue::OriginalChecksumMismatch => write!(f, "Checksum mismatch of document."),
            Issue::MissingThumbnail => write!(f, "Thumbnail of document does not exist."),
            Issue::ArchiveFieldsInconsistent => write!(
                f,
                "Document has only one of archive filename and archive checksum."
            ),
            Issue::MissingArchive => {
                write!(f, "Archived version of document does not exist.")
            }
            Issue::UnreadableArchive(e) => {
                write!(f, "Cannot read archive file of document: {e}")
            }
            Issue::ArchiveChecksumMismatch => {
                write!(f, "Checksum mismatch of archived document.")
            }
            Issue::EmptyContent => write!(f, "Document contains no text content."),
            Issue::OrphanedFile(path) => {
                write!(f, "Orphaned file in media dir: {}", path.display())
            }
            Issue::LeftoverStagedFile(path) => {
                write!(f, "Leftover staged file: {}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityMessage {
    pub doc_id: Option<u64>,
    pub issue: Issue,
}

impl SanityMessage {
    pub fn level(&self) -> Level {
        self.issue.level()
    }
}

/// Everything a sanity check run found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanityMessages {
    messages: Vec<SanityMessage>,
}

impl SanityMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, doc_id: Option<u64>, issue: Issue) {
        self.messages.push(SanityMessage { doc_id, issue });
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SanityMessage> {
        self.messages.iter()
    }

    fn has_level(&self, level: Level) -> bool {
        self.messages.iter().any(|m| m.level() == level)
    }

    pub fn has_error(&self) -> bool {
        self.has_level(Level::Error)
    }

    pub fn has_warning(&self) -> bool {
        self.has_level(Level::Warning)
    }

    pub fn has_info(&self) -> bool {
        self.has_level(Level::Info)
    }

    /// Write every message to the log at its own level.
    pub fn log_messages(&self) {
        if self.messages.is_empty() {
            tracing::info!("sanity checker detected no issues");
            return;
        }
        for message in &self.messages {
            let doc_id = message.doc_id.map(|id| id.to_string());
            let doc_id = doc_id.as_deref().unwrap_or("-");
            match message.level() {
                Level::Error => tracing::error!(doc_id, "{}", message.issue),
                Level::Warning => tracing::warn!(doc_id, "{}", message.issue),
                Level::Info => tracing::info!(doc_id, "{}", message.issue),
            }
        }
    }

    /// Map the most severe level found to the task result.
    pub fn outcome(&self) -> Result<String> {
        if self.has_error() {
            Err(Error::SanityCheckFailed(FAILED_WITH_ERRORS.to_string()))
        } else if self.has_warning() {
            Ok(EXITED_WITH_WARNINGS.to_string())
        } else if self.has_info() {
            Ok(EXITED_WITH_INFOS.to_string())
        } else {
            Ok(NO_ISSUES.to_string())
        }
    }
}

/// Check every document against the media tree.
pub fn check_sanity(db: &DocumentDb, store: &ArchiveStore) -> Result<SanityMessages> {
    let mut messages = SanityMessages::new();
    let mut unclaimed: BTreeSet<PathBuf> =
        store.list_media_files()?.into_iter().collect();

    for doc in db.list_documents()? {
        let id = Some(doc.id);

        let source = store.source_path(&doc);
        unclaimed.remove(&source);
        if !source.is_file() {
            messages.push(id, Issue::MissingOriginal);
        } else {
            match checksum_file(&source) {
                Ok(checksum) if checksum != doc.checksum => {
                    messages.push(id, Issue::OriginalChecksumMismatch);
                }
                Ok(_) => {}
                Err(e) => messages.push(id, Issue::UnreadableOriginal(e.to_string())),
            }
        }

        match store.thumbnail_path(&doc) {
            Some(thumb) if thumb.is_file() => {
                unclaimed.remove(&thumb);
            }
            _ => messages.push(id, Issue::MissingThumbnail),
        }

        match (&doc.archive_filename, &doc.archive_checksum) {
            (Some(_), Some(expected)) => {
                if let Some(archive) = store.archive_path(&doc) {
                    unclaimed.remove(&archive);
                    if !archive.is_file() {
                        messages.push(id, Issue::MissingArchive);
                    } else {
                        match checksum_file(&archive) {
                            Ok(checksum) if checksum != *expected => {
                                messages.push(id, Issue::ArchiveChecksumMismatch);
                            }
                            Ok(_) => {}
                            Err(e) => messages
                                .push(id, Issue::UnreadableArchive(e.to_string())),
                        }
                    }
                }
            }
            (None, None) => {}
            _ => {
                if let Some(archive) = store.archive_path(&doc) {
                    unclaimed.remove(&archive);
                }
                messages.push(id, Issue::ArchiveFieldsInconsistent);
            }
        }

        if doc.content.trim().is_empty() {
            messages.push(id, Issue::EmptyContent);
        }
    }

    for path in unclaimed {
        messages.push(None, Issue::OrphanedFile(path));
    }
    for path in store.list_staged_files()? {
        messages.push(None, Issue::LeftoverStagedFile(path));
    }

    Ok(messages)
}
