use std::{path::Path, sync::Arc};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};

use crate::{
    document::{DocumentRecord, MatchingAlgorithm, MatchingRule, RuleKind},
    error::{Error, Result},
};

const DOCUMENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("documents");
const TAGS: TableDefinition<u64, &[u8]> = TableDefinition::new("tags");
const CORRESPONDENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("correspondents");
const DOCUMENT_TYPES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("document_types");
const STORAGE_PATHS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("storage_paths");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

fn rule_table(kind: RuleKind) -> TableDefinition<'static, u64, &'static [u8]> {
    match kind {
        RuleKind::Tag => TAGS,
        RuleKind::Correspondent => CORRESPONDENTS,
        RuleKind::DocumentType => DOCUMENT_TYPES,
        RuleKind::StoragePath => STORAGE_PATHS,
    }
}

/// The relational store: document records, matching rules and settings.
///
/// Every method runs in its own redb transaction, so each call is an
/// all-or-nothing unit. Clones share the same open database.
#[derive(Clone)]
pub struct DocumentDb {
    db: Arc<Database>,
}

impl DocumentDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        for kind in RuleKind::ALL {
            txn.open_table(rule_table(kind))?;
        }
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    // -- Documents --

    /// Insert a new record, assigning the next free id. The id carried by
    /// `record` is ignored.
    pub fn insert_document(
        &self,
        record: DocumentRecord,
    ) -> Result<DocumentRecord> {
        self.insert_document_with(record, |_| {})
    }

    /// Like [`insert_document`](Self::insert_document), but lets `f` fill in
    /// fields derived from the assigned id within the same transaction.
    pub fn insert_document_with<F>(
        &self,
        mut record: DocumentRecord,
        f: F,
    ) -> Result<DocumentRecord>
    where
        F: FnOnce(&mut DocumentRecord),
    {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            let next_id = table
                .last()?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1);
            record.id = next_id;
            f(&mut record);
            let bytes = serde_json::to_vec(&record)?;
            table.insert(record.id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(record)
    }

    pub fn get_document(&self, id: u64) -> Result<Option<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Like [`get_document`](Self::get_document), but a missing record is
    /// an error.
    pub fn require_document(&self, id: u64) -> Result<DocumentRecord> {
        self.get_document(id)?.ok_or_else(|| Error::NotFound {
            kind: "document",
            name: id.to_string(),
        })
    }

    /// All records in the store's natural (id) order.
    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// Records for the given ids in a single read transaction. Unknown ids
    /// are skipped; the result is in id order without duplicates.
    pub fn documents_by_ids(&self, ids: &[u64]) -> Result<Vec<DocumentRecord>> {
        let mut wanted = ids.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::with_capacity(wanted.len());
        for id in wanted {
            if let Some(guard) = table.get(id)? {
                result.push(serde_json::from_slice(guard.value())?);
            }
        }
        Ok(result)
    }

    pub fn document_count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table.len()?)
    }

    /// Find a record whose original or archive checksum equals `checksum`.
    pub fn find_by_checksum(
        &self,
        checksum: &str,
    ) -> Result<Option<DocumentRecord>> {
        Ok(self.list_documents()?.into_iter().find(|doc| {
            doc.checksum == checksum
                || doc.archive_checksum.as_deref() == Some(checksum)
        }))
    }

    /// Read, modify and write back one record inside a single write
    /// transaction. Returns the stored record.
    pub fn update_document<F>(&self, id: u64, f: F) -> Result<DocumentRecord>
    where
        F: FnOnce(&mut DocumentRecord),
    {
        let txn = self.db.begin_write()?;
        let updated = {
            let mut table = txn.open_table(DOCUMENTS)?;
            let bytes = table.get(id)?.map(|g| g.value().to_vec());
            let Some(bytes) = bytes else {
                return Err(Error::NotFound {
                    kind: "document",
                    name: id.to_string(),
                });
            };
            let mut record: DocumentRecord = serde_json::from_slice(&bytes)?;
            f(&mut record);
            record.id = id;
            let bytes = serde_json::to_vec(&record)?;
            table.insert(id, bytes.as_slice())?;
            record
        };
        txn.commit()?;
        Ok(updated)
    }

    pub fn remove_document(&self, id: u64) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.remove(id)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    // -- Matching rules --

    pub fn add_rule(
        &self,
        kind: RuleKind,
        name: &str,
        matching_algorithm: MatchingAlgorithm,
    ) -> Result<MatchingRule> {
        let txn = self.db.begin_write()?;
        let rule = {
            let mut table = txn.open_table(rule_table(kind))?;
            let id = table
                .last()?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1);
            let rule = MatchingRule {
                id,
                kind,
                name: name.to_string(),
                matching_algorithm,
            };
            let bytes = serde_json::to_vec(&rule)?;
            table.insert(id, bytes.as_slice())?;
            rule
        };
        txn.commit()?;
        Ok(rule)
    }

    pub fn list_rules(&self, kind: RuleKind) -> Result<Vec<MatchingRule>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(rule_table(kind))?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    pub fn remove_rule(&self, kind: RuleKind, id: u64) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(rule_table(kind))?;
            table.remove(id)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Ids of the rules of `kind` that the classifier assigns.
    pub fn automatic_rule_ids(&self, kind: RuleKind) -> Result<Vec<u64>> {
        Ok(self
            .list_rules(kind)?
            .into_iter()
            .filter(MatchingRule::is_automatic)
            .map(|r| r.id)
            .collect())
    }

    /// Whether any tag, correspondent, document type or storage path uses
    /// automatic matching.
    pub fn has_automatic_rules(&self) -> Result<bool> {
        for kind in RuleKind::ALL {
            if !self.automatic_rule_ids(kind)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for DocumentDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDb").finish_non_exhaustive()
    }
}
