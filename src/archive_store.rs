use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use fs2::FileExt;

use crate::{document::DocumentRecord, error::Result};

const ORIGINALS: &str = "originals";
const ARCHIVE: &str = "archive";
const THUMBNAILS: &str = "thumbnails";
const STAGING: &str = "staging";
const LOCK_FILE: &str = "media.lock";

/// Role of a derived file, used to name staged artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRole {
    Archive,
    Thumbnail,
}

impl ArtifactRole {
    fn as_str(self) -> &'static str {
        match self {
            ArtifactRole::Archive => "archive",
            ArtifactRole::Thumbnail => "thumbnail",
        }
    }
}

/// The on-disk media tree holding originals, archive renditions and
/// thumbnails.
///
/// Every mutation of the tree happens while holding [`MediaLock`], a single
/// exclusive file lock shared by all threads and processes using the same
/// root.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [ORIGINALS, ARCHIVE, THUMBNAILS, STAGING] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn originals_dir(&self) -> PathBuf {
        self.root.join(ORIGINALS)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE)
    }

    pub fn thumbnail_dir(&self) -> PathBuf {
        self.root.join(THUMBNAILS)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING)
    }

    pub fn source_path(&self, doc: &DocumentRecord) -> PathBuf {
        self.originals_dir().join(&doc.filename)
    }

    pub fn archive_path(&self, doc: &DocumentRecord) -> Option<PathBuf> {
        doc.archive_filename
            .as_ref()
            .map(|name| self.archive_dir().join(name))
    }

    pub fn thumbnail_path(&self, doc: &DocumentRecord) -> Option<PathBuf> {
        doc.thumbnail_filename
            .as_ref()
            .map(|name| self.thumbnail_dir().join(name))
    }

    /// Block until the media lock is held.
    pub fn lock(&self) -> Result<MediaLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(LOCK_FILE))?;
        FileExt::lock_exclusive(&file)?;
        tracing::trace!(root = %self.root.display(), "media lock acquired");
        Ok(MediaLock { file })
    }

    /// First archive file name for `doc` that is either its current name or
    /// not yet taken: `0000042.pdf`, then `0000042_01.pdf`, and so on.
    ///
    /// Call with the media lock held, otherwise another writer can claim the
    /// name before it is used.
    pub fn unique_archive_filename(
        &self,
        doc: &DocumentRecord,
        extension: &str,
    ) -> String {
        let mut counter = 0u32;
        loop {
            let candidate = if counter == 0 {
                format!("{}.{extension}", doc.file_stem())
            } else {
                format!("{}_{counter:02}.{extension}", doc.file_stem())
            };
            if doc.archive_filename.as_deref() == Some(candidate.as_str()) {
                return candidate;
            }
            if !self.archive_dir().join(&candidate).exists() {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Copy or move `src` into the staging area under a name derived from
    /// the document and role, replacing any earlier staged copy.
    pub fn stage(
        &self,
        doc_id: u64,
        role: ArtifactRole,
        src: &Path,
    ) -> Result<PathBuf> {
        if let Some(previous) = self.staged_artifact(doc_id, role)? {
            std::fs::remove_file(previous)?;
        }
        let name = format!(
            "{:07}.{}.{}",
            doc_id,
            role.as_str(),
            extension_of(src).unwrap_or("bin")
        );
        let staged = self.staging_dir().join(name);
        move_file(src, &staged)?;
        Ok(staged)
    }

    /// The staged artifact for `doc_id` and `role`, if one is left over.
    pub fn staged_artifact(
        &self,
        doc_id: u64,
        role: ArtifactRole,
    ) -> Result<Option<PathBuf>> {
        let prefix = format!("{:07}.{}.", doc_id, role.as_str());
        for entry in std::fs::read_dir(self.staging_dir())? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Rename a staged file to its final location.
    pub fn install(&self, staged: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(staged, dest)?;
        Ok(())
    }

    /// Every regular file in the originals, archive and thumbnail
    /// directories.
    pub fn list_media_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir in [
            self.originals_dir(),
            self.archive_dir(),
            self.thumbnail_dir(),
        ] {
            collect_files(&dir, &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    pub fn list_staged_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        collect_files(&self.staging_dir(), &mut files)?;
        files.sort();
        Ok(files)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

pub fn extension_of(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Move a file, falling back to copy and delete across filesystems.
pub fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dest)?;
    std::fs::remove_file(src)?;
    Ok(())
}

/// Guard for the archive store's exclusive lock. Released on drop.
#[derive(Debug)]
pub struct MediaLock {
    file: File,
}

impl Drop for MediaLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "failed to release media lock");
        }
    }
}
