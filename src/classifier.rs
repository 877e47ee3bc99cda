//! Token-based classifier that suggests tags, correspondents, document types
//! and storage paths for documents whose rules use automatic matching.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::OpenOptions,
    io::Write,
    path::Path,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    document::{DocumentRecord, RuleKind},
    document_db::DocumentDb,
    error::{Error, Result},
};

/// Bumped whenever the persisted layout changes. Models with another
/// version are discarded on load.
pub const FORMAT_VERSION: u32 = 1;

const MIN_TOKEN_LEN: usize = 2;

/// Token statistics for one label, or for all documents of a kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TokenStats {
    documents: u64,
    total_tokens: u64,
    tokens: BTreeMap<String, u64>,
}

impl TokenStats {
    fn add(&mut self, tokens: &[String]) {
        self.documents += 1;
        self.total_tokens += tokens.len() as u64;
        for token in tokens {
            *self.tokens.entry(token.clone()).or_default() += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct KindModel {
    all: TokenStats,
    labels: BTreeMap<u64, TokenStats>,
}

impl KindModel {
    /// Log-odds of `label` against every other outcome for `tokens`.
    fn log_odds(&self, label: &TokenStats, tokens: &[String]) -> f64 {
        let vocabulary = self.all.tokens.len().max(1) as f64;
        let rest_docs = self.all.documents.saturating_sub(label.documents);
        let rest_total = self.all.total_tokens.saturating_sub(label.total_tokens);

        let mut odds = ((label.documents as f64 + 1.0)
            / (rest_docs as f64 + 1.0))
            .ln();
        for token in tokens {
            let in_label = label.tokens.get(token).copied().unwrap_or(0);
            let in_all = self.all.tokens.get(token).copied().unwrap_or(0);
            let in_rest = in_all.saturating_sub(in_label);
            let p_label =
                (in_label as f64 + 1.0) / (label.total_tokens as f64 + vocabulary);
            let p_rest = (in_rest as f64 + 1.0) / (rest_total as f64 + vocabulary);
            odds += (p_label / p_rest).ln();
        }
        odds
    }

    /// Labels whose log-odds are positive, best first.
    fn positive_labels(&self, tokens: &[String]) -> Vec<u64> {
        let mut scored: Vec<(u64, f64)> = self
            .labels
            .iter()
            .map(|(id, stats)| (*id, self.log_odds(stats, tokens)))
            .filter(|(_, odds)| *odds > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().map(|(id, _)| id).collect()
    }
}

/// Labels suggested for a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prediction {
    pub tag_ids: Vec<u64>,
    pub correspondent_id: Option<u64>,
    pub document_type_id: Option<u64>,
    pub storage_path_id: Option<u64>,
}

/// The persisted classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierModel {
    pub format_version: u32,
    /// Incremented by every save. Guards against overwriting a model that
    /// another trainer saved after this one was loaded.
    pub generation: u64,
    /// Hash of the training data the model was last trained on.
    pub data_hash: Option<String>,
    kinds: BTreeMap<String, KindModel>,
}

impl Default for ClassifierModel {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            generation: 0,
            data_hash: None,
            kinds: BTreeMap::new(),
        }
    }
}

/// Just enough of a model file to check its generation.
#[derive(Deserialize)]
struct ModelHeader {
    format_version: u32,
    #[serde(default)]
    generation: u64,
}

impl ClassifierModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the model at `path`. A missing, unreadable or incompatible model
    /// yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Self>(&bytes) {
            Ok(model) if model.format_version == FORMAT_VERSION => Ok(Some(model)),
            Ok(model) => {
                tracing::info!(
                    found = model.format_version,
                    expected = FORMAT_VERSION,
                    "classifier model has an incompatible format, discarding"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "unreadable classifier model, discarding"
                );
                Ok(None)
            }
        }
    }

    pub fn is_trained(&self) -> bool {
        self.data_hash.is_some()
    }

    /// Train on every document in `db`. Returns `false` when the training
    /// data is identical to what the model was last trained on.
    pub fn train(&mut self, db: &DocumentDb) -> Result<bool> {
        let documents = db.list_documents()?;
        if documents.is_empty() {
            return Err(Error::Training("no training data available".to_string()));
        }

        let mut automatic = BTreeMap::new();
        for kind in RuleKind::ALL {
            let ids: BTreeSet<u64> =
                db.automatic_rule_ids(kind)?.into_iter().collect();
            automatic.insert(kind, ids);
        }

        let samples: Vec<(Vec<String>, BTreeMap<RuleKind, Vec<u64>>)> = documents
            .iter()
            .map(|doc| (tokenize(&doc.content), labels_of(doc, &automatic)))
            .collect();

        let data_hash = hash_training_data(&documents, &samples);
        if self.data_hash.as_deref() == Some(data_hash.as_str()) {
            return Ok(false);
        }

        let mut kinds = BTreeMap::new();
        for kind in RuleKind::ALL {
            if automatic[&kind].is_empty() {
                continue;
            }
            let mut model = KindModel::default();
            for (tokens, labels) in &samples {
                model.all.add(tokens);
                for label in &labels[&kind] {
                    model.labels.entry(*label).or_default().add(tokens);
                }
            }
            kinds.insert(kind.as_str().to_string(), model);
        }

        tracing::debug!(
            documents = documents.len(),
            kinds = kinds.len(),
            "classifier trained"
        );
        self.kinds = kinds;
        self.data_hash = Some(data_hash);
        Ok(true)
    }

    pub fn predict(&self, content: &str) -> Prediction {
        let tokens = tokenize(content);
        let labels = |kind: RuleKind| {
            self.kinds
                .get(kind.as_str())
                .map(|model| model.positive_labels(&tokens))
                .unwrap_or_default()
        };
        Prediction {
            tag_ids: {
                let mut tags = labels(RuleKind::Tag);
                tags.sort_unstable();
                tags
            },
            correspondent_id: labels(RuleKind::Correspondent).first().copied(),
            document_type_id: labels(RuleKind::DocumentType).first().copied(),
            storage_path_id: labels(RuleKind::StoragePath).first().copied(),
        }
    }

    /// Persist the model to `path`, holding the exclusive lock at
    /// `lock_path` for the duration.
    ///
    /// Fails with [`Error::ClassifierConflict`] if the model on disk has a
    /// different generation than this one, meaning another trainer saved
    /// since this model was loaded. On success the generation is bumped.
    pub fn save(&mut self, path: &Path, lock_path: &Path) -> Result<()> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)?;
        FileExt::lock_exclusive(&lock)?;

        let result = self.save_locked(path);

        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!(error = %e, "failed to release classifier lock");
        }
        result
    }

    fn save_locked(&mut self, path: &Path) -> Result<()> {
        let found = current_generation(path)?.unwrap_or(self.generation);
        if found != self.generation {
            return Err(Error::ClassifierConflict {
                expected: self.generation,
                found,
            });
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut next = self.clone();
        next.generation += 1;
        let bytes = serde_json::to_vec(&next)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;

        self.generation = next.generation;
        Ok(())
    }
}

/// Generation of the compatible model at `path`, if there is one.
fn current_generation(path: &Path) -> Result<Option<u64>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice::<ModelHeader>(&bytes)
        .ok()
        .filter(|header| header.format_version == FORMAT_VERSION)
        .map(|header| header.generation))
}

fn labels_of(
    doc: &DocumentRecord,
    automatic: &BTreeMap<RuleKind, BTreeSet<u64>>,
) -> BTreeMap<RuleKind, Vec<u64>> {
    let keep = |kind: RuleKind, ids: Vec<u64>| -> Vec<u64> {
        let mut ids: Vec<u64> = ids
            .into_iter()
            .filter(|id| automatic[&kind].contains(id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    };

    let mut labels = BTreeMap::new();
    labels.insert(RuleKind::Tag, keep(RuleKind::Tag, doc.tag_ids.clone()));
    labels.insert(
        RuleKind::Correspondent,
        keep(RuleKind::Correspondent, doc.correspondent_id.into_iter().collect()),
    );
    labels.insert(
        RuleKind::DocumentType,
        keep(RuleKind::DocumentType, doc.document_type_id.into_iter().collect()),
    );
    labels.insert(
        RuleKind::StoragePath,
        keep(RuleKind::StoragePath, doc.storage_path_id.into_iter().collect()),
    );
    labels
}

fn hash_training_data(
    documents: &[DocumentRecord],
    samples: &[(Vec<String>, BTreeMap<RuleKind, Vec<u64>>)],
) -> String {
    let mut hasher = Sha256::new();
    for (doc, (_, labels)) in documents.iter().zip(samples) {
        hasher.update(doc.id.to_le_bytes());
        hasher.update(doc.content.as_bytes());
        for (kind, ids) in labels {
            hasher.update(kind.as_str().as_bytes());
            for id in ids {
                hasher.update(id.to_le_bytes());
            }
        }
    }
    format!("{:x}", hasher.finalize())
}

fn tokenize(content: &str) -> Vec<String> {
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_lowercase)
        .collect()
}
