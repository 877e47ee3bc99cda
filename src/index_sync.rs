//! Keeps the search index in line with the document store.

use std::path::Path;

use kdam::{BarExt, tqdm};
use rayon::prelude::*;

use crate::{
    document::DocumentRecord,
    document_db::DocumentDb,
    error::Result,
    settings::Settings,
    tantivy_index::{IndexEntry, SearchIndex},
};

/// Merge the index into a single segment. Returns the number of segments
/// that were merged.
pub fn optimize(index: &SearchIndex, settings: &Settings) -> Result<usize> {
    let merged =
        index.optimize(settings.index_writer_memory, settings.index_writer_timeout)?;
    tracing::info!(segments = merged, "search index optimized");
    Ok(merged)
}

/// Wipe the index directory and rebuild it from every record in the store,
/// in id order.
pub fn recreate(
    dir: &Path,
    db: &DocumentDb,
    settings: &Settings,
    progress_disabled: bool,
) -> Result<SearchIndex> {
    let index = SearchIndex::create_fresh(dir)?;
    let documents = db.list_documents()?;
    tracing::info!(documents = documents.len(), "rebuilding search index");

    // Project in parallel, then write sequentially through one session.
    let entries: Vec<IndexEntry> =
        documents.par_iter().map(IndexEntry::from_record).collect();

    let mut pb = tqdm!(
        total = entries.len(),
        desc = "Indexing",
        disable = progress_disabled
    );
    index.with_writer(
        settings.index_writer_memory,
        settings.index_writer_timeout,
        |session| {
            for entry in &entries {
                session.update(entry)?;
                pb.update(1)?;
            }
            Ok(())
        },
    )?;
    if !progress_disabled {
        eprintln!();
    }

    Ok(index)
}

pub fn update_document(
    index: &SearchIndex,
    settings: &Settings,
    doc: &DocumentRecord,
) -> Result<()> {
    update_documents(index, settings, std::slice::from_ref(doc)).map(|_| ())
}

/// Update the entries for `docs` in a single writer session.
pub fn update_documents(
    index: &SearchIndex,
    settings: &Settings,
    docs: &[DocumentRecord],
) -> Result<usize> {
    index.with_writer(
        settings.index_writer_memory,
        settings.index_writer_timeout,
        |session| {
            for doc in docs {
                session.update_record(doc)?;
            }
            Ok(session.pending())
        },
    )
}

pub fn remove_document(
    index: &SearchIndex,
    settings: &Settings,
    id: u64,
) -> Result<()> {
    index.with_writer(
        settings.index_writer_memory,
        settings.index_writer_timeout,
        |session| {
            session.remove(id);
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_db::tests::sample_record;

    fn seeded_db(tmp: &tempfile::TempDir, titles: &[&str]) -> DocumentDb {
        let db = DocumentDb::open(&tmp.path().join("documents.redb")).unwrap();
        for title in titles {
            db.insert_document(sample_record(title)).unwrap();
        }
        db
    }

    #[test]
    fn recreate_matches_store() {
        let tmp = tempfile::tempdir().unwrap();
        let db = seeded_db(&tmp, &["alpha", "beta", "gamma"]);
        let dir = tmp.path().join("index");

        let index = recreate(&dir, &db, &Settings::default(), true).unwrap();

        let expected: Vec<IndexEntry> = db
            .list_documents()
            .unwrap()
            .iter()
            .map(IndexEntry::from_record)
            .collect();
        assert_eq!(index.all_entries().unwrap(), expected);
    }

    #[test]
    fn recreate_discards_stale_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let db = seeded_db(&tmp, &["alpha"]);
        let dir = tmp.path().join("index");

        {
            let index = SearchIndex::open(&dir).unwrap();
            let mut ghost = sample_record("ghost");
            ghost.id = 99;
            update_document(&index, &Settings::default(), &ghost).unwrap();
        }

        let index = recreate(&dir, &db, &Settings::default(), true).unwrap();
        let ids: Vec<u64> =
            index.all_entries().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn recreate_empty_store() {
        let tmp = tempfile::tempdir().unwrap();
        let db = seeded_db(&tmp, &[]);
        let index =
            recreate(&tmp.path().join("index"), &db, &Settings::default(), true)
                .unwrap();
        assert_eq!(index.doc_count().unwrap(), 0);
    }

    #[test]
    fn update_many_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let db = seeded_db(&tmp, &["alpha", "beta"]);
        let index = SearchIndex::open_in_ram().unwrap();
        let settings = Settings::default();

        let docs = db.list_documents().unwrap();
        assert_eq!(update_documents(&index, &settings, &docs).unwrap(), 2);
        assert_eq!(index.doc_count().unwrap(), 2);

        remove_document(&index, &settings, docs[0].id).unwrap();
        let ids: Vec<u64> =
            index.all_entries().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![docs[1].id]);
    }

    #[test]
    fn optimize_keeps_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let db = seeded_db(&tmp, &["alpha", "beta"]);
        let index = SearchIndex::open(&tmp.path().join("index")).unwrap();
        let settings = Settings::default();
        for doc in db.list_documents().unwrap() {
            update_document(&index, &settings, &doc).unwrap();
        }

        let before = index.all_entries().unwrap();
        optimize(&index, &settings).unwrap();
        assert_eq!(index.all_entries().unwrap(), before);
        assert_eq!(index.segment_count().unwrap(), 1);
    }
}
