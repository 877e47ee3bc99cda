//! Turning intake files into new documents.

use std::path::Path;

use chrono::Utc;

use crate::{
    archive_store::extension_of,
    archiver::{self, ParsedArtifacts},
    barcodes::file_mime_type,
    classifier::ClassifierModel,
    document::{DocumentRecord, checksum_file},
    error::{Error, Result},
    index_sync,
    notify::{StatusUpdate, TaskStatus, publish_best_effort},
    tasks::{ConsumeRequest, TaskContext},
};

/// Creates a document from an intake file.
///
/// `Ok(None)` means consumption ended without a document and without a
/// more specific error.
pub trait Consumer: Send + Sync {
    fn try_consume_file(
        &self,
        ctx: &TaskContext,
        request: &ConsumeRequest,
    ) -> Result<Option<DocumentRecord>>;
}

/// The built-in consumer: parses the file, stores the original and its
/// derived files, records the document and indexes it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveConsumer;

impl Consumer for ArchiveConsumer {
    fn try_consume_file(
        &self,
        ctx: &TaskContext,
        request: &ConsumeRequest,
    ) -> Result<Option<DocumentRecord>> {
        let progress = Progress { ctx, request };
        match consume(ctx, request, &progress) {
            Ok(doc) => {
                progress.send(100, TaskStatus::Success, "finished");
                Ok(Some(doc))
            }
            Err(e) => {
                progress.send(100, TaskStatus::Failed, &e.to_string());
                Err(e)
            }
        }
    }
}

struct Progress<'a> {
    ctx: &'a TaskContext,
    request: &'a ConsumeRequest,
}

impl Progress<'_> {
    fn send(&self, current: u32, status: TaskStatus, message: &str) {
        let update = StatusUpdate {
            filename: Some(self.request.display_name()),
            task_id: self.request.task_id.clone(),
            current_progress: current,
            max_progress: 100,
            status,
            message: message.to_string(),
        };
        publish_best_effort(self.ctx.notifier.as_ref(), &update);
    }
}

fn consume(
    ctx: &TaskContext,
    request: &ConsumeRequest,
    progress: &Progress<'_>,
) -> Result<DocumentRecord> {
    let path = request.path.as_path();
    let name = request.display_name();
    progress.send(0, TaskStatus::Starting, "new_file");

    if !path.is_file() {
        return Err(Error::Consumer(format!(
            "Cannot consume {}: File not found.",
            path.display()
        )));
    }

    let mime_type = file_mime_type(path);
    let Some(mut parser) = ctx.parsers.parser_for(&mime_type) else {
        return Err(Error::Consumer(format!(
            "{name}: Unsupported mime type {mime_type}"
        )));
    };

    let checksum = checksum_file(path)?;
    if let Some(existing) = ctx.db.find_by_checksum(&checksum)? {
        return Err(Error::Consumer(format!(
            "Not consuming {name}: It is a duplicate of {existing}"
        )));
    }

    progress.send(20, TaskStatus::Working, "parsing_document");
    let artifacts = archiver::parse_artifacts(&mut *parser, path, &mime_type, Some(&name))
        .map_err(|e| Error::Consumer(format!("{name}: Error while consuming document: {e}")))?;

    progress.send(70, TaskStatus::Working, "save_document");
    let record = new_record(ctx, request, &mime_type, checksum, &artifacts)?;
    let extension = extension_of(path).unwrap_or("bin").to_lowercase();

    let doc = ctx.db.insert_document_with(record, |d| {
        d.filename = format!("{}.{extension}", d.file_stem());
    })?;

    let stored = store_document(ctx, path, &doc, artifacts);
    let doc = match stored {
        Ok(doc) => doc,
        Err(e) => {
            discard(ctx, &doc);
            return Err(e);
        }
    };

    let index = ctx.open_index()?;
    index_sync::update_document(&index, &ctx.settings, &doc)?;

    ctx.signals.document_saved(&doc, true);
    tracing::info!(doc_id = doc.id, title = %doc.title, "document consumed");
    Ok(doc)
}

fn new_record(
    ctx: &TaskContext,
    request: &ConsumeRequest,
    mime_type: &str,
    checksum: String,
    artifacts: &ParsedArtifacts,
) -> Result<DocumentRecord> {
    let overrides = &request.overrides;
    let original_filename = request.display_name();
    let title = overrides.title.clone().unwrap_or_else(|| {
        Path::new(&original_filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| original_filename.clone())
    });

    let now = Utc::now();
    let mut record = DocumentRecord {
        id: 0,
        title,
        mime_type: mime_type.to_string(),
        checksum,
        archive_checksum: None,
        content: artifacts.content.clone(),
        filename: String::new(),
        original_filename,
        archive_filename: None,
        thumbnail_filename: None,
        correspondent_id: overrides.correspondent_id,
        document_type_id: overrides.document_type_id,
        storage_path_id: None,
        tag_ids: overrides.tag_ids.clone().unwrap_or_default(),
        created: overrides.created.unwrap_or(now),
        modified: now,
    };

    if let Some(model) = ClassifierModel::load(&ctx.data_dir.classifier_model())? {
        let prediction = model.predict(&record.content);
        if overrides.correspondent_id.is_none() {
            record.correspondent_id = prediction.correspondent_id;
        }
        if overrides.document_type_id.is_none() {
            record.document_type_id = prediction.document_type_id;
        }
        if overrides.tag_ids.is_none() {
            record.tag_ids = prediction.tag_ids;
        }
        record.storage_path_id = prediction.storage_path_id;
    }

    Ok(record)
}

/// Copy the original into the media tree, install the derived files and
/// remove the intake file.
fn store_document(
    ctx: &TaskContext,
    source: &Path,
    doc: &DocumentRecord,
    artifacts: ParsedArtifacts,
) -> Result<DocumentRecord> {
    {
        let _lock = ctx.store.lock()?;
        let dest = ctx.store.source_path(doc);
        std::fs::copy(source, &dest)?;
    }
    let doc = archiver::install_artifacts(&ctx.db, &ctx.store, doc, artifacts)?;
    std::fs::remove_file(source)?;
    Ok(doc)
}

/// Undo a half-finished consumption.
fn discard(ctx: &TaskContext, doc: &DocumentRecord) {
    if let Err(e) = ctx.db.remove_document(doc.id) {
        tracing::error!(doc_id = doc.id, error = %e, "failed to remove record");
    }
    let original = ctx.store.source_path(doc);
    if original.exists()
        && let Err(e) = std::fs::remove_file(&original)
    {
        tracing::error!(
            path = %original.display(),
            error = %e,
            "failed to remove stored original"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_dir::DataDir,
        document::{MatchingAlgorithm, RuleKind},
        notify::BroadcastNotifier,
        tasks::ConsumeOverrides,
    };

    fn context(tmp: &tempfile::TempDir) -> TaskContext {
        let data_dir = DataDir::resolve(Some(&tmp.path().join("data"))).unwrap();
        TaskContext::open(data_dir).unwrap()
    }

    fn intake(tmp: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let dir = tmp.path().join("consume");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn consumes_text_file() {
        let tmp = tempfile::tempdir().unwrap();
        let notifier = BroadcastNotifier::new(16);
        let mut rx = notifier.subscribe();
        let ctx = context(&tmp).with_notifier(Box::new(notifier));
        let path = intake(&tmp, "invoice.txt", "Invoice 42\n");

        let request = ConsumeRequest::new(&path).with_task_id("task-1");
        let doc = ArchiveConsumer
            .try_consume_file(&ctx, &request)
            .unwrap()
            .unwrap();

        assert_eq!(doc.id, 1);
        assert_eq!(doc.title, "invoice");
        assert_eq!(doc.filename, "0000001.txt");
        assert_eq!(doc.original_filename, "invoice.txt");
        assert_eq!(doc.content, "Invoice 42");
        assert!(doc.has_archive());
        assert!(!path.exists());
        assert!(ctx.store.source_path(&doc).is_file());
        assert_eq!(ctx.open_index().unwrap().doc_count().unwrap(), 1);

        let mut statuses = Vec::new();
        while let Ok((_, update)) = rx.try_recv() {
            statuses.push(update.status);
        }
        assert_eq!(statuses.first(), Some(&TaskStatus::Starting));
        assert_eq!(statuses.last(), Some(&TaskStatus::Success));
    }

    #[test]
    fn overrides_apply() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&tmp);
        let path = intake(&tmp, "scan.txt", "hello");

        let request = ConsumeRequest {
            overrides: ConsumeOverrides {
                filename: Some("renamed.txt".into()),
                title: Some("My title".into()),
                correspondent_id: Some(3),
                document_type_id: None,
                tag_ids: Some(vec![2, 1]),
                created: None,
            },
            ..ConsumeRequest::new(&path)
        };
        let doc = ArchiveConsumer
            .try_consume_file(&ctx, &request)
            .unwrap()
            .unwrap();

        assert_eq!(doc.title, "My title");
        assert_eq!(doc.original_filename, "renamed.txt");
        assert_eq!(doc.correspondent_id, Some(3));
        assert_eq!(doc.tag_ids, vec![2, 1]);
    }

    #[test]
    fn duplicate_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&tmp);

        let first = intake(&tmp, "a.txt", "same body");
        ArchiveConsumer
            .try_consume_file(&ctx, &ConsumeRequest::new(&first))
            .unwrap();

        let second = intake(&tmp, "b.txt", "same body");
        let err = ArchiveConsumer
            .try_consume_file(&ctx, &ConsumeRequest::new(&second))
            .unwrap_err();
        assert!(matches!(err, Error::Consumer(msg) if msg.contains("duplicate")));
        assert!(second.exists());
        assert_eq!(ctx.db.document_count().unwrap(), 1);
    }

    #[test]
    fn missing_and_unsupported_files() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&tmp);

        let missing = tmp.path().join("nope.txt");
        assert!(matches!(
            ArchiveConsumer.try_consume_file(&ctx, &ConsumeRequest::new(&missing)),
            Err(Error::Consumer(_))
        ));

        let binary = intake(&tmp, "photo.jpg", "jpeg");
        assert!(matches!(
            ArchiveConsumer.try_consume_file(&ctx, &ConsumeRequest::new(&binary)),
            Err(Error::Consumer(msg)) if msg.contains("image/jpeg")
        ));
        assert!(binary.exists());
    }

    #[test]
    fn classifier_fills_in_missing_labels() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(&tmp);
        let tag = ctx
            .db
            .add_rule(RuleKind::Tag, "invoices", MatchingAlgorithm::Auto)
            .unwrap();

        for (i, body) in ["invoice amount due", "invoice payable amount"]
            .iter()
            .enumerate()
        {
            let path = intake(&tmp, &format!("inv{i}.txt"), body);
            let request = ConsumeRequest {
                overrides: ConsumeOverrides {
                    tag_ids: Some(vec![tag.id]),
                    ..Default::default()
                },
                ..ConsumeRequest::new(&path)
            };
            ArchiveConsumer.try_consume_file(&ctx, &request).unwrap();
        }
        let path = intake(&tmp, "beach.txt", "summer beach holiday");
        ArchiveConsumer
            .try_consume_file(&ctx, &ConsumeRequest::new(&path))
            .unwrap();

        let mut model = ClassifierModel::new();
        model.train(&ctx.db).unwrap();
        model
            .save(&ctx.data_dir.classifier_model(), &ctx.data_dir.classifier_lock())
            .unwrap();

        let path = intake(&tmp, "new.txt", "invoice amount");
        let doc = ArchiveConsumer
            .try_consume_file(&ctx, &ConsumeRequest::new(&path))
            .unwrap()
            .unwrap();
        assert_eq!(doc.tag_ids, vec![tag.id]);
    }
}
