use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "DOCVAULT_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The DOCVAULT_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/docvault/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("docvault")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn documents_db(&self) -> PathBuf {
        self.root.join("documents.redb")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    /// Root of the archive store (originals, archive, thumbnails).
    pub fn media_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("media");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }

    /// Intake directory watched by the task dispatcher.
    pub fn consume_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("consume");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }

    pub fn classifier_model(&self) -> PathBuf {
        self.root.join("classifier.json")
    }

    pub fn classifier_lock(&self) -> PathBuf {
        self.root.join("classifier.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.documents_db(), tmp.path().join("documents.redb"));
        assert_eq!(dir.index_dir(), tmp.path().join("index"));
        assert_eq!(
            dir.classifier_model(),
            tmp.path().join("classifier.json")
        );
    }

    #[test]
    fn media_and_consume_dirs_are_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        let media = dir.media_dir().unwrap();
        let consume = dir.consume_dir().unwrap();

        assert!(media.is_dir());
        assert!(consume.is_dir());
        assert_eq!(media, tmp.path().join("media"));
        assert_eq!(consume, tmp.path().join("consume"));
    }
}
