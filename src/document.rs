use std::{io::Read, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// A document as recorded in the relational store.
///
/// `archive_checksum` and `archive_filename` are either both set or both
/// unset. When set, the archive file exists and hashes to the checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: u64,
    pub title: String,
    pub mime_type: String,
    /// SHA-256 of the original file.
    pub checksum: String,
    pub archive_checksum: Option<String>,
    pub content: String,
    /// Original file name relative to the originals directory.
    pub filename: String,
    /// Name the file had when it was handed to the consumer.
    pub original_filename: String,
    pub archive_filename: Option<String>,
    pub thumbnail_filename: Option<String>,
    pub correspondent_id: Option<u64>,
    pub document_type_id: Option<u64>,
    pub storage_path_id: Option<u64>,
    #[serde(default)]
    pub tag_ids: Vec<u64>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn has_archive(&self) -> bool {
        self.archive_filename.is_some()
    }

    /// Stable base name used for every file derived from this record.
    pub fn file_stem(&self) -> String {
        format!("{:07}", self.id)
    }
}

impl std::fmt::Display for DocumentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (ID: {})", self.title, self.id)
    }
}

/// Entity kinds that can act as classification targets.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Tag,
    Correspondent,
    DocumentType,
    StoragePath,
}

impl RuleKind {
    pub const ALL: [RuleKind; 4] = [
        RuleKind::Tag,
        RuleKind::Correspondent,
        RuleKind::DocumentType,
        RuleKind::StoragePath,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Tag => "tag",
            RuleKind::Correspondent => "correspondent",
            RuleKind::DocumentType => "document_type",
            RuleKind::StoragePath => "storage_path",
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tag" => Ok(RuleKind::Tag),
            "correspondent" => Ok(RuleKind::Correspondent),
            "document_type" | "document-type" => Ok(RuleKind::DocumentType),
            "storage_path" | "storage-path" => Ok(RuleKind::StoragePath),
            other => Err(format!("unknown rule kind: {other}")),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MatchingAlgorithm {
    #[default]
    None,
    Any,
    All,
    Literal,
    Regex,
    Fuzzy,
    /// Assigned by the classifier.
    Auto,
}

impl MatchingAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchingAlgorithm::None => "none",
            MatchingAlgorithm::Any => "any",
            MatchingAlgorithm::All => "all",
            MatchingAlgorithm::Literal => "literal",
            MatchingAlgorithm::Regex => "regex",
            MatchingAlgorithm::Fuzzy => "fuzzy",
            MatchingAlgorithm::Auto => "auto",
        }
    }
}

impl std::fmt::Display for MatchingAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MatchingAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(MatchingAlgorithm::None),
            "any" => Ok(MatchingAlgorithm::Any),
            "all" => Ok(MatchingAlgorithm::All),
            "literal" => Ok(MatchingAlgorithm::Literal),
            "regex" => Ok(MatchingAlgorithm::Regex),
            "fuzzy" => Ok(MatchingAlgorithm::Fuzzy),
            "auto" => Ok(MatchingAlgorithm::Auto),
            other => Err(format!("unknown matching algorithm: {other}")),
        }
    }
}

/// A tag, correspondent, document type or storage path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingRule {
    pub id: u64,
    pub kind: RuleKind,
    pub name: String,
    pub matching_algorithm: MatchingAlgorithm,
}

impl MatchingRule {
    pub fn is_automatic(&self) -> bool {
        self.matching_algorithm == MatchingAlgorithm::Auto
    }
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hex-encoded SHA-256 of a file, streamed in fixed-size chunks.
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_file_matches_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, b"hello archive").unwrap();

        assert_eq!(
            checksum_file(&path).unwrap(),
            checksum_bytes(b"hello archive")
        );
        assert_eq!(checksum_bytes(b"").len(), 64);
    }

    #[test]
    fn rule_kind_parses_both_spellings() {
        assert_eq!("tag".parse::<RuleKind>().unwrap(), RuleKind::Tag);
        assert_eq!(
            "document-type".parse::<RuleKind>().unwrap(),
            RuleKind::DocumentType
        );
        assert!("label".parse::<RuleKind>().is_err());
    }

    #[test]
    fn only_auto_is_automatic() {
        let mut rule = MatchingRule {
            id: 1,
            kind: RuleKind::Tag,
            name: "invoices".to_string(),
            matching_algorithm: MatchingAlgorithm::Any,
        };
        assert!(!rule.is_automatic());
        rule.matching_algorithm = MatchingAlgorithm::Auto;
        assert!(rule.is_automatic());
    }
}
