use std::{
    path::Path,
    time::{Duration, Instant},
};

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    TantivyError,
    collector::{DocSetCollector, TopDocs},
    directory::error::LockError,
    query::{AllQuery, QueryParser},
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::{
    document::DocumentRecord,
    error::{Error, Result},
};

const WRITER_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Field names used in the schema.
pub mod fields {
    pub const ID: &str = "id";
    pub const TITLE: &str = "title";
    pub const CONTENT: &str = "content";
    pub const ORIGINAL_FILENAME: &str = "original_filename";
    pub const MIME_TYPE: &str = "mime_type";
    pub const CORRESPONDENT_ID: &str = "correspondent_id";
    pub const DOCUMENT_TYPE_ID: &str = "document_type_id";
    pub const STORAGE_PATH_ID: &str = "storage_path_id";
    pub const TAG_IDS: &str = "tag_ids";
    pub const CREATED: &str = "created";
    pub const MODIFIED: &str = "modified";
    pub const HAS_ARCHIVE: &str = "has_archive";
}

/// The search-index projection of one document record.
///
/// Derived purely from [`DocumentRecord`], so the index can be rebuilt from
/// the relational store at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: u64,
    pub title: String,
    pub content: String,
    pub original_filename: String,
    pub mime_type: String,
    pub correspondent_id: Option<u64>,
    pub document_type_id: Option<u64>,
    pub storage_path_id: Option<u64>,
    /// Sorted and deduplicated.
    pub tag_ids: Vec<u64>,
    /// Seconds since the Unix epoch.
    pub created: i64,
    pub modified: i64,
    pub has_archive: bool,
}

impl IndexEntry {
    pub fn from_record(doc: &DocumentRecord) -> Self {
        let mut tag_ids = doc.tag_ids.clone();
        tag_ids.sort_unstable();
        tag_ids.dedup();

        Self {
            id: doc.id,
            title: doc.title.clone(),
            content: doc.content.clone(),
            original_filename: doc.original_filename.clone(),
            mime_type: doc.mime_type.clone(),
            correspondent_id: doc.correspondent_id,
            document_type_id: doc.document_type_id,
            storage_path_id: doc.storage_path_id,
            tag_ids,
            created: doc.created.timestamp(),
            modified: doc.modified.timestamp(),
            has_archive: doc.has_archive(),
        }
    }
}

/// Manages the Tantivy full-text index over document records.
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    schema: Schema,
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub id: Field,
    pub title: Field,
    pub content: Field,
    pub original_filename: Field,
    pub mime_type: Field,
    pub correspondent_id: Field,
    pub document_type_id: Field,
    pub storage_path_id: Field,
    pub tag_ids: Field,
    pub created: Field,
    pub modified: Field,
    pub has_archive: Field,
}

/// A search result from the index.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f32,
    pub id: u64,
    pub title: String,
    pub original_filename: String,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_u64_field(fields::ID, INDEXED | STORED | FAST);

    let text_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    builder.add_text_field(fields::TITLE, text_opts.clone());
    builder.add_text_field(fields::CONTENT, text_opts);

    builder.add_text_field(fields::ORIGINAL_FILENAME, STRING | STORED);
    builder.add_text_field(fields::MIME_TYPE, STRING | STORED);
    builder.add_u64_field(fields::CORRESPONDENT_ID, INDEXED | STORED);
    builder.add_u64_field(fields::DOCUMENT_TYPE_ID, INDEXED | STORED);
    builder.add_u64_field(fields::STORAGE_PATH_ID, INDEXED | STORED);
    builder.add_u64_field(fields::TAG_IDS, INDEXED | STORED);
    builder.add_i64_field(fields::CREATED, STORED | FAST);
    builder.add_i64_field(fields::MODIFIED, STORED | FAST);
    builder.add_bool_field(fields::HAS_ARCHIVE, STORED);

    builder.build()
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

impl SearchIndex {
    /// Open or create a search index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let schema = build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(
                mmap_dir,
                schema,
                tantivy::IndexSettings::default(),
            )?
        };

        Self::from_index(index)
    }

    /// Discard whatever lives at `dir` and create an empty index with the
    /// current schema.
    pub fn create_fresh(dir: &Path) -> Result<Self> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Self::open(dir)
    }

    /// Create an in-memory search index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let schema = build_schema();
        let index = Index::create_in_ram(schema);
        Self::from_index(index)
    }

    fn from_index(index: Index) -> Result<Self> {
        register_tokenizers(&index);
        let schema = index.schema();
        let reader = index.reader()?;
        Ok(Self {
            index,
            reader,
            schema,
        })
    }

    /// Get the resolved field handles.
    pub fn fields(&self) -> SchemaFields {
        let f = |name: &str| self.schema.get_field(name).unwrap();
        SchemaFields {
            id: f(fields::ID),
            title: f(fields::TITLE),
            content: f(fields::CONTENT),
            original_filename: f(fields::ORIGINAL_FILENAME),
            mime_type: f(fields::MIME_TYPE),
            correspondent_id: f(fields::CORRESPONDENT_ID),
            document_type_id: f(fields::DOCUMENT_TYPE_ID),
            storage_path_id: f(fields::STORAGE_PATH_ID),
            tag_ids: f(fields::TAG_IDS),
            created: f(fields::CREATED),
            modified: f(fields::MODIFIED),
            has_archive: f(fields::HAS_ARCHIVE),
        }
    }

    /// Acquire the index writer, waiting up to `timeout` while another
    /// writer (in this or another process) holds the lock.
    pub fn writer(
        &self,
        memory_budget: usize,
        timeout: Duration,
    ) -> Result<IndexWriter> {
        let started = Instant::now();
        loop {
            match self.index.writer(memory_budget) {
                Ok(writer) => return Ok(writer),
                Err(TantivyError::LockFailure(LockError::LockBusy, _)) => {
                    if started.elapsed() >= timeout {
                        return Err(Error::IndexLocked(timeout));
                    }
                    std::thread::sleep(WRITER_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Open a writer session. See [`WriterSession`].
    pub fn session(
        &self,
        memory_budget: usize,
        timeout: Duration,
    ) -> Result<WriterSession<'_>> {
        let writer = self.writer(memory_budget, timeout)?;
        Ok(WriterSession {
            index: self,
            writer: Some(writer),
            pending: 0,
        })
    }

    /// Run `body` inside a writer session. Buffered writes are committed on
    /// every exit path, including when `body` fails; the body's error wins
    /// over a commit error.
    pub fn with_writer<T, F>(
        &self,
        memory_budget: usize,
        timeout: Duration,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut WriterSession<'_>) -> Result<T>,
    {
        let mut session = self.session(memory_budget, timeout)?;
        match body(&mut session) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(commit_err) = session.commit() {
                    tracing::error!(
                        error = %commit_err,
                        "failed to commit index writes after error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Replace the entry for `entry.id` via the given writer.
    pub fn upsert(&self, writer: &IndexWriter, entry: &IndexEntry) -> Result<()> {
        let f = self.fields();

        // Delete any existing entry with this id first.
        writer.delete_term(tantivy::Term::from_field_u64(f.id, entry.id));

        let mut doc = TantivyDocument::default();
        doc.add_u64(f.id, entry.id);
        doc.add_text(f.title, &entry.title);
        doc.add_text(f.content, &entry.content);
        doc.add_text(f.original_filename, &entry.original_filename);
        doc.add_text(f.mime_type, &entry.mime_type);
        if let Some(id) = entry.correspondent_id {
            doc.add_u64(f.correspondent_id, id);
        }
        if let Some(id) = entry.document_type_id {
            doc.add_u64(f.document_type_id, id);
        }
        if let Some(id) = entry.storage_path_id {
            doc.add_u64(f.storage_path_id, id);
        }
        for tag in &entry.tag_ids {
            doc.add_u64(f.tag_ids, *tag);
        }
        doc.add_i64(f.created, entry.created);
        doc.add_i64(f.modified, entry.modified);
        doc.add_bool(f.has_archive, entry.has_archive);

        writer.add_document(doc)?;
        Ok(())
    }

    /// Delete a single entry by document id.
    pub fn delete(&self, writer: &IndexWriter, id: u64) {
        let f = self.fields();
        writer.delete_term(tantivy::Term::from_field_u64(f.id, id));
    }

    /// Merge all searchable segments into one and drop unused files.
    /// Logical contents are unchanged.
    pub fn optimize(
        &self,
        memory_budget: usize,
        timeout: Duration,
    ) -> Result<usize> {
        let mut writer = self.writer(memory_budget, timeout)?;
        let segment_ids = self.index.searchable_segment_ids()?;
        let merged = segment_ids.len();
        if merged > 1 {
            writer.merge(&segment_ids).wait()?;
        }
        writer.garbage_collect_files().wait()?;
        writer.wait_merging_threads()?;
        Ok(merged)
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.index.searchable_segment_ids()?.len())
    }

    pub fn doc_count(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }

    /// Every stored entry, sorted by document id.
    pub fn all_entries(&self) -> Result<Vec<IndexEntry>> {
        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let addresses = searcher.search(&AllQuery, &DocSetCollector)?;

        let mut entries = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            entries.push(self.entry_from_doc(&doc));
        }
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    /// Search titles and content with BM25 scoring.
    ///
    /// Returns the top `limit` results. The `title` field is boosted 2x.
    pub fn search(&self, query_str: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let f = self.fields();
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let mut parser =
            QueryParser::for_index(&self.index, vec![f.title, f.content]);
        parser.set_field_boost(f.title, 2.0);

        let (query, _errors) = parser.parse_query_lenient(query_str);
        let top_docs =
            searcher.search(&query, &TopDocs::with_limit(limit.max(1)))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            results.push(SearchHit {
                score,
                id: extract_u64(&doc, f.id),
                title: extract_text(&doc, f.title),
                original_filename: extract_text(&doc, f.original_filename),
            });
        }

        Ok(results)
    }

    fn entry_from_doc(&self, doc: &TantivyDocument) -> IndexEntry {
        let f = self.fields();
        IndexEntry {
            id: extract_u64(doc, f.id),
            title: extract_text(doc, f.title),
            content: extract_text(doc, f.content),
            original_filename: extract_text(doc, f.original_filename),
            mime_type: extract_text(doc, f.mime_type),
            correspondent_id: extract_opt_u64(doc, f.correspondent_id),
            document_type_id: extract_opt_u64(doc, f.document_type_id),
            storage_path_id: extract_opt_u64(doc, f.storage_path_id),
            tag_ids: doc
                .get_all(f.tag_ids)
                .filter_map(|v| v.as_u64())
                .collect(),
            created: extract_i64(doc, f.created),
            modified: extract_i64(doc, f.modified),
            has_archive: doc
                .get_first(f.has_archive)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex").finish_non_exhaustive()
    }
}

/// An exclusive, buffered handle on the index writer.
///
/// Writes become visible when the session is committed: explicitly through
/// [`commit`](Self::commit), or when the session is dropped.
pub struct WriterSession<'a> {
    index: &'a SearchIndex,
    writer: Option<IndexWriter>,
    pending: usize,
}

impl WriterSession<'_> {
    fn writer(&self) -> &IndexWriter {
        // Only `commit` and `drop` take the writer, and both end the session.
        self.writer
            .as_ref()
            .expect("writer is present until the session ends")
    }

    pub fn update(&mut self, entry: &IndexEntry) -> Result<()> {
        self.index.upsert(self.writer(), entry)?;
        self.pending += 1;
        Ok(())
    }

    pub fn update_record(&mut self, doc: &DocumentRecord) -> Result<()> {
        self.update(&IndexEntry::from_record(doc))
    }

    pub fn remove(&mut self, id: u64) {
        self.index.delete(self.writer(), id);
        self.pending += 1;
    }

    /// Number of buffered operations in this session.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Commit buffered writes and release the writer lock.
    pub fn commit(mut self) -> Result<usize> {
        if let Some(mut writer) = self.writer.take() {
            writer.commit()?;
        }
        Ok(self.pending)
    }
}

impl Drop for WriterSession<'_> {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.commit()
        {
            tracing::error!(error = %e, "failed to commit index writer session");
        }
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn extract_opt_u64(doc: &TantivyDocument, field: Field) -> Option<u64> {
    doc.get_first(field).and_then(|v| v.as_u64())
}

fn extract_i64(doc: &TantivyDocument, field: Field) -> i64 {
    doc.get_first(field).and_then(|v| v.as_i64()).unwrap_or(0)
}
