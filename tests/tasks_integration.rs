use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use docvault::{
    DataDir,
    DocumentDb,
    DocumentRecord,
    Error,
    Result,
    Settings,
    TaskContext,
    barcodes::{BarcodeReader, TIFF_MIME},
    consumer::Consumer,
    document::{MatchingAlgorithm, RuleKind, checksum_bytes},
    notify::{BroadcastNotifier, STATUS_GROUP, TaskStatus},
    sanity,
    signals::DocumentListener,
    tantivy_index::IndexEntry,
    tasks::{self, ConsumeRequest},
};
use tempfile::TempDir;

fn context(tmp: &TempDir) -> TaskContext {
    let data_dir = DataDir::resolve(Some(&tmp.path().join("data"))).unwrap();
    TaskContext::open(data_dir).unwrap()
}

fn with_barcodes(ctx: TaskContext) -> TaskContext {
    let settings = Settings {
        enable_barcodes: true,
        ..ctx.settings.clone()
    };
    ctx.with_settings(settings)
}

fn intake_file(tmp: &TempDir, name: &str, body: &str) -> PathBuf {
    let dir = tmp.path().join("intake");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// A record with its original in place but no derived files.
fn insert_plain(ctx: &TaskContext, title: &str, mime_type: &str) -> DocumentRecord {
    let body = format!("{title} body");
    let now = Utc::now();
    let record = DocumentRecord {
        id: 0,
        title: title.to_string(),
        mime_type: mime_type.to_string(),
        checksum: checksum_bytes(body.as_bytes()),
        archive_checksum: None,
        content: body.clone(),
        filename: String::new(),
        original_filename: format!("{title}.txt"),
        archive_filename: None,
        thumbnail_filename: None,
        correspondent_id: None,
        document_type_id: None,
        storage_path_id: None,
        tag_ids: Vec::new(),
        created: now,
        modified: now,
    };
    let doc = ctx
        .db
        .insert_document_with(record, |d| d.filename = format!("{}.txt", d.file_stem()))
        .unwrap();
    std::fs::write(ctx.store.source_path(&doc), body).unwrap();
    doc
}

fn consume(ctx: &TaskContext, path: &Path) -> Result<String> {
    tasks::consume_file(ctx, ConsumeRequest::new(path))
}

// -- Barcode splitting --

/// Pretends every TIFF is a two-document scan with a separator on page 1.
struct FakeTiffReader {
    converted: Arc<Mutex<Option<PathBuf>>>,
    parts: usize,
}

impl BarcodeReader for FakeTiffReader {
    fn supported(&self, mime_type: &str) -> bool {
        mime_type == TIFF_MIME
    }

    fn needs_conversion(&self, mime_type: &str) -> bool {
        mime_type == TIFF_MIME
    }

    fn convert_to_scannable(&self, path: &Path) -> Result<PathBuf> {
        let converted = path.with_extension("converted.pdf");
        std::fs::copy(path, &converted)?;
        *self.converted.lock().unwrap() = Some(converted.clone());
        Ok(converted)
    }

    fn detect(&self, _path: &Path) -> Result<Vec<usize>> {
        Ok(vec![1])
    }

    fn split(&self, _path: &Path, _separators: &[usize]) -> Result<Vec<Vec<u8>>> {
        Ok((0..self.parts)
            .map(|n| format!("part {n}").into_bytes())
            .collect())
    }
}

#[test]
fn tiff_with_separator_is_split_into_intake() {
    let tmp = tempfile::tempdir().unwrap();
    let converted = Arc::new(Mutex::new(None));
    let notifier = BroadcastNotifier::new(16);
    let mut updates = notifier.subscribe();
    let ctx = with_barcodes(context(&tmp))
        .with_barcode_reader(Box::new(FakeTiffReader {
            converted: converted.clone(),
            parts: 2,
        }))
        .with_notifier(Box::new(notifier));

    let scan = intake_file(&tmp, "scan.tiff", "tiff bytes");
    let mut request = ConsumeRequest::new(&scan).with_task_id("task-1");
    request.overrides.filename = Some("scan.pdf".to_string());

    let result = tasks::consume_file(&ctx, request).unwrap();
    assert_eq!(result, tasks::FILE_SUCCESSFULLY_SPLIT);

    assert!(!scan.exists());
    let converted = converted.lock().unwrap().clone().unwrap();
    assert!(!converted.exists());

    let intake = scan.parent().unwrap();
    assert_eq!(
        std::fs::read_to_string(intake.join("0_scan.pdf")).unwrap(),
        "part 0"
    );
    assert_eq!(
        std::fs::read_to_string(intake.join("1_scan.pdf")).unwrap(),
        "part 1"
    );
    assert_eq!(ctx.db.document_count().unwrap(), 0);

    let (group, update) = updates.try_recv().unwrap();
    assert_eq!(group, STATUS_GROUP);
    assert_eq!(update.status, TaskStatus::Success);
    assert_eq!(update.current_progress, 100);
    assert_eq!(update.task_id.as_deref(), Some("task-1"));
    assert_eq!(update.filename.as_deref(), Some("scan.pdf"));
}

#[test]
fn separators_without_parts_keep_the_original() {
    let tmp = tempfile::tempdir().unwrap();
    let converted = Arc::new(Mutex::new(None));
    let ctx = with_barcodes(context(&tmp)).with_barcode_reader(Box::new(
        FakeTiffReader {
            converted: converted.clone(),
            parts: 0,
        },
    ));

    let scan = intake_file(&tmp, "scan.tiff", "tiff bytes");
    let err = consume(&ctx, &scan).unwrap_err();
    assert!(matches!(err, Error::Barcode(_)), "got {err:?}");

    assert!(scan.exists());
    let converted = converted.lock().unwrap().clone().unwrap();
    assert!(!converted.exists());
}

#[test]
fn unsupported_type_with_barcodes_falls_through() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = with_barcodes(context(&tmp));

    let letter = intake_file(&tmp, "letter.txt", "Dear reader");
    let result = consume(&ctx, &letter).unwrap();
    assert_eq!(result, "Success. New document id 1 created");
}

#[test]
fn barcodes_disabled_skips_detection() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp).with_barcode_reader(Box::new(FakeTiffReader {
        converted: Arc::new(Mutex::new(None)),
        parts: 2,
    }));

    let scan = intake_file(&tmp, "scan.tiff", "tiff bytes");
    let err = consume(&ctx, &scan).unwrap_err();
    let Error::Consumer(message) = err else {
        panic!("expected consumer error, got {err:?}");
    };
    assert!(message.contains("Unsupported mime type image/tiff"));
    assert!(scan.exists());
}

// -- Consumption --

#[test]
fn consumed_text_document_is_archived_and_indexed() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);

    let letter = intake_file(&tmp, "letter.txt", "Dear reader,\r\nthe invoice is attached.");
    assert_eq!(
        consume(&ctx, &letter).unwrap(),
        "Success. New document id 1 created"
    );
    assert!(!letter.exists());

    let doc = ctx.db.require_document(1).unwrap();
    assert_eq!(doc.original_filename, "letter.txt");
    assert_eq!(doc.filename, "0000001.txt");
    assert!(doc.content.contains("invoice"));
    assert!(ctx.store.source_path(&doc).is_file());
    assert!(ctx.store.archive_path(&doc).unwrap().is_file());
    assert!(ctx.store.thumbnail_path(&doc).unwrap().is_file());

    assert_eq!(tasks::sanity_check(&ctx).unwrap(), sanity::NO_ISSUES);

    let hits = ctx.open_index().unwrap().search("invoice", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 1);
}

#[test]
fn duplicate_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);

    consume(&ctx, &intake_file(&tmp, "a.txt", "same body")).unwrap();
    let again = intake_file(&tmp, "b.txt", "same body");
    let err = consume(&ctx, &again).unwrap_err();
    let Error::Consumer(message) = err else {
        panic!("expected consumer error, got {err:?}");
    };
    assert!(message.contains("duplicate"));
    assert!(again.exists());
    assert_eq!(ctx.db.document_count().unwrap(), 1);
}

struct SilentConsumer;

impl Consumer for SilentConsumer {
    fn try_consume_file(
        &self,
        _ctx: &TaskContext,
        _request: &ConsumeRequest,
    ) -> Result<Option<DocumentRecord>> {
        Ok(None)
    }
}

#[test]
fn consumer_without_document_or_error_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp).with_consumer(Box::new(SilentConsumer));

    let err = consume(&ctx, &intake_file(&tmp, "a.txt", "body")).unwrap_err();
    match err {
        Error::Consumer(message) => {
            assert_eq!(message, tasks::CONSUMER_RETURNED_NOTHING)
        }
        other => panic!("expected consumer error, got {other:?}"),
    }
}

// -- Bulk update --

#[derive(Default, Clone)]
struct Recorder(Arc<Mutex<Vec<(u64, bool)>>>);

impl DocumentListener for Recorder {
    fn document_saved(&self, doc: &DocumentRecord, created: bool) -> Result<()> {
        self.0.lock().unwrap().push((doc.id, created));
        Ok(())
    }
}

struct Failing;

impl DocumentListener for Failing {
    fn document_saved(&self, _doc: &DocumentRecord, _created: bool) -> Result<()> {
        Err(Error::Config("listener down".to_string()))
    }
}

#[test]
fn bulk_update_notifies_and_reindexes() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ctx = context(&tmp);
    let recorder = Recorder::default();
    ctx.connect(Box::new(Failing));
    ctx.connect(Box::new(recorder.clone()));

    let docs: Vec<DocumentRecord> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|t| insert_plain(&ctx, t, "text/plain"))
        .collect();

    let result = tasks::bulk_update_documents(&ctx, &[1, 2, 3, 99]).unwrap();
    assert_eq!(result, "Updated 3 document(s).");
    assert_eq!(
        *recorder.0.lock().unwrap(),
        vec![(1, false), (2, false), (3, false)]
    );

    let expected: Vec<IndexEntry> = docs.iter().map(IndexEntry::from_record).collect();
    assert_eq!(ctx.open_index().unwrap().all_entries().unwrap(), expected);
}

/// Retitles every saved record through the shared database handle.
struct Retitler(DocumentDb);

impl DocumentListener for Retitler {
    fn document_saved(&self, doc: &DocumentRecord, _created: bool) -> Result<()> {
        self.0
            .update_document(doc.id, |d| d.title = format!("{} (filed)", d.title))?;
        Ok(())
    }
}

#[test]
fn bulk_update_indexes_listener_edits() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ctx = context(&tmp);
    let retitler = Retitler(ctx.db.clone());
    ctx.connect(Box::new(retitler));

    insert_plain(&ctx, "alpha", "text/plain");
    insert_plain(&ctx, "beta", "text/plain");

    let result = tasks::bulk_update_documents(&ctx, &[1, 2]).unwrap();
    assert_eq!(result, "Updated 2 document(s).");

    let entries = ctx.open_index().unwrap().all_entries().unwrap();
    let titles: Vec<&str> = entries.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, vec!["alpha (filed)", "beta (filed)"]);

    let expected: Vec<IndexEntry> = ctx
        .db
        .list_documents()
        .unwrap()
        .iter()
        .map(IndexEntry::from_record)
        .collect();
    assert_eq!(entries, expected);
}

// -- Archive regeneration --

#[test]
fn archive_without_parser_leaves_record_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    let doc = insert_plain(&ctx, "scan", "image/x-unknown");

    tasks::update_document_archive_file(&ctx, doc.id).unwrap();
    assert_eq!(ctx.db.require_document(doc.id).unwrap(), doc);
}

#[test]
fn archive_of_missing_document_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    let err = tasks::update_document_archive_file(&ctx, 42).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "got {err:?}");
}

#[test]
fn archive_regeneration_fills_derived_fields() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    let doc = insert_plain(&ctx, "memo", "text/plain");

    tasks::update_document_archive_file(&ctx, doc.id).unwrap();
    let updated = ctx.db.require_document(doc.id).unwrap();
    assert!(updated.archive_checksum.is_some());
    assert!(updated.thumbnail_filename.is_some());
    assert_eq!(updated.content, "memo body");

    let ids: Vec<u64> = ctx
        .open_index()
        .unwrap()
        .all_entries()
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec![doc.id]);
}

#[test]
fn archive_is_kept_when_index_is_locked() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    let settings = Settings {
        index_writer_timeout: Duration::from_millis(100),
        ..ctx.settings.clone()
    };
    let ctx = ctx.with_settings(settings);
    let doc = insert_plain(&ctx, "memo", "text/plain");

    let index = ctx.open_index().unwrap();
    let _session = index
        .session(ctx.settings.index_writer_memory, Duration::from_secs(5))
        .unwrap();

    let result = tasks::update_document_archive_file(&ctx, doc.id).unwrap();
    assert!(result.starts_with("Archive of memo"), "got {result}");

    let updated = ctx.db.require_document(doc.id).unwrap();
    assert_eq!(updated.archive_filename.as_deref(), Some("0000001.txt"));
    assert!(ctx.store.archive_path(&updated).unwrap().is_file());
}

// -- Classifier --

#[test]
fn training_without_automatic_rules_is_a_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    ctx.db
        .add_rule(RuleKind::Tag, "manual", MatchingAlgorithm::Literal)
        .unwrap();

    let model = ctx.data_dir.classifier_model();
    std::fs::write(&model, "not a model").unwrap();

    assert_eq!(
        tasks::train_classifier(&ctx).unwrap(),
        "No automatic matching items, not training."
    );
    assert_eq!(std::fs::read_to_string(&model).unwrap(), "not a model");
}

#[test]
fn training_is_skipped_when_data_is_unchanged() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    let tag = ctx
        .db
        .add_rule(RuleKind::Tag, "invoices", MatchingAlgorithm::Auto)
        .unwrap();
    let doc = insert_plain(&ctx, "invoice", "text/plain");
    ctx.db
        .update_document(doc.id, |d| d.tag_ids = vec![tag.id])
        .unwrap();

    assert_eq!(
        tasks::train_classifier(&ctx).unwrap(),
        "Classifier model updated."
    );
    assert!(ctx.data_dir.classifier_model().is_file());
    assert_eq!(
        tasks::train_classifier(&ctx).unwrap(),
        "Training data unchanged."
    );
}

#[test]
fn training_errors_do_not_fail_the_task() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    ctx.db
        .add_rule(RuleKind::Correspondent, "bank", MatchingAlgorithm::Auto)
        .unwrap();

    let result = tasks::train_classifier(&ctx).unwrap();
    assert!(result.starts_with("Classifier error:"), "got {result}");
}

// -- Sanity and repair --

#[test]
fn sanity_reports_and_repair_fixes_missing_thumbnail() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    consume(&ctx, &intake_file(&tmp, "letter.txt", "Dear reader")).unwrap();
    let doc = ctx.db.require_document(1).unwrap();

    std::fs::remove_file(ctx.store.thumbnail_path(&doc).unwrap()).unwrap();
    match tasks::sanity_check(&ctx).unwrap_err() {
        Error::SanityCheckFailed(message) => {
            assert_eq!(message, sanity::FAILED_WITH_ERRORS)
        }
        other => panic!("expected sanity failure, got {other:?}"),
    }

    let result = tasks::repair_archives(&ctx).unwrap();
    assert!(result.contains("1 regenerated"), "got {result}");
    assert_eq!(tasks::sanity_check(&ctx).unwrap(), sanity::NO_ISSUES);
}

#[test]
fn orphaned_media_file_is_a_warning() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    consume(&ctx, &intake_file(&tmp, "letter.txt", "Dear reader")).unwrap();

    std::fs::write(ctx.store.originals_dir().join("stray.pdf"), "stray").unwrap();
    assert_eq!(
        tasks::sanity_check(&ctx).unwrap(),
        sanity::EXITED_WITH_WARNINGS
    );
}

// -- Index --

#[test]
fn reindex_reproduces_the_store() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(&tmp);
    consume(&ctx, &intake_file(&tmp, "a.txt", "first letter")).unwrap();
    consume(&ctx, &intake_file(&tmp, "b.txt", "second letter")).unwrap();
    ctx.db.update_document(1, |d| d.title = "renamed".to_string()).unwrap();

    assert_eq!(
        tasks::index_reindex(&ctx, true).unwrap(),
        "Index rebuilt with 2 document(s)."
    );

    let expected: Vec<IndexEntry> = ctx
        .db
        .list_documents()
        .unwrap()
        .iter()
        .map(IndexEntry::from_record)
        .collect();
    assert_eq!(ctx.open_index().unwrap().all_entries().unwrap(), expected);

    let result = tasks::index_optimize(&ctx).unwrap();
    assert!(result.starts_with("Index optimized"));
    assert_eq!(ctx.open_index().unwrap().doc_count().unwrap(), 2);
}
