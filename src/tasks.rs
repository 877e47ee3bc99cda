//! Task entry points. Each function is one independently runnable unit of
//! work that returns a short human-readable result or a typed failure.
//!
//! Tasks may run concurrently from several threads sharing one
//! [`TaskContext`], and may be retried after a crash.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::{
    archive_store::ArchiveStore,
    archiver::{self, Regenerated},
    barcodes::{BarcodeReader, PdfBarcodeReader, file_mime_type, write_to_intake},
    classifier::ClassifierModel,
    consumer::{ArchiveConsumer, Consumer},
    data_dir::DataDir,
    document_db::DocumentDb,
    error::{Error, Result},
    index_sync,
    notify::{StatusNotifier, StatusUpdate, TracingNotifier, publish_best_effort},
    parsers::ParserRegistry,
    repair,
    sanity,
    settings::Settings,
    signals::{DocumentListener, Signals},
    tantivy_index::SearchIndex,
};

pub const FILE_SUCCESSFULLY_SPLIT: &str = "File successfully split";
pub const CONSUMER_RETURNED_NOTHING: &str =
    "Unknown error: Returned document was null, but no error message was given.";

/// Everything a task needs: stores, settings and collaborators.
pub struct TaskContext {
    pub data_dir: DataDir,
    pub settings: Settings,
    pub db: DocumentDb,
    pub store: ArchiveStore,
    pub parsers: ParserRegistry,
    pub barcodes: Box<dyn BarcodeReader>,
    pub notifier: Box<dyn StatusNotifier>,
    pub signals: Signals,
    pub consumer: Box<dyn Consumer>,
}

impl TaskContext {
    /// Open the stores under `data_dir` with the built-in collaborators.
    pub fn open(data_dir: DataDir) -> Result<Self> {
        let db = DocumentDb::open(&data_dir.documents_db())?;
        let settings = Settings::load(&db)?;
        let store = ArchiveStore::open(&data_dir.media_dir()?)?;
        let barcodes = Box::new(PdfBarcodeReader::new(settings.barcode_string.clone()));

        Ok(Self {
            data_dir,
            settings,
            db,
            store,
            parsers: ParserRegistry::with_defaults()?,
            barcodes,
            notifier: Box::new(TracingNotifier),
            signals: Signals::new(),
            consumer: Box::new(ArchiveConsumer),
        })
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn with_barcode_reader(mut self, reader: Box<dyn BarcodeReader>) -> Self {
        self.barcodes = reader;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn StatusNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_consumer(mut self, consumer: Box<dyn Consumer>) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn connect(&mut self, listener: Box<dyn DocumentListener>) {
        self.signals.connect(listener);
    }

    /// Open (or create) the search index.
    pub fn open_index(&self) -> Result<SearchIndex> {
        SearchIndex::open(&self.data_dir.index_dir())
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("data_dir", &self.data_dir)
            .field("settings", &self.settings)
            .field("parsers", &self.parsers)
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

/// Values that replace what the consumer would otherwise derive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeOverrides {
    pub filename: Option<String>,
    pub title: Option<String>,
    pub correspondent_id: Option<u64>,
    pub document_type_id: Option<u64>,
    pub tag_ids: Option<Vec<u64>>,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeRequest {
    pub path: PathBuf,
    pub overrides: ConsumeOverrides,
    pub task_id: Option<String>,
}

impl ConsumeRequest {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            overrides: ConsumeOverrides::default(),
            task_id: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// The override filename, or the file's own name.
    pub fn display_name(&self) -> String {
        self.overrides.filename.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

pub fn index_optimize(ctx: &TaskContext) -> Result<String> {
    let index = ctx.open_index()?;
    let merged = index_sync::optimize(&index, &ctx.settings)?;
    Ok(format!("Index optimized, {merged} segment(s) merged."))
}

pub fn index_reindex(ctx: &TaskContext, progress_bar_disable: bool) -> Result<String> {
    let index = index_sync::recreate(
        &ctx.data_dir.index_dir(),
        &ctx.db,
        &ctx.settings,
        progress_bar_disable,
    )?;
    Ok(format!("Index rebuilt with {} document(s).", index.doc_count()?))
}

/// Retrain the classifier if any matching rule uses automatic matching.
/// Training problems are logged and never fail the task.
pub fn train_classifier(ctx: &TaskContext) -> Result<String> {
    if !ctx.db.has_automatic_rules()? {
        tracing::info!("no automatic matching items, not training");
        return Ok("No automatic matching items, not training.".to_string());
    }

    match retrain(ctx) {
        Ok(true) => Ok("Classifier model updated.".to_string()),
        Ok(false) => Ok("Training data unchanged.".to_string()),
        Err(e) => {
            tracing::warn!(error = %e, "classifier error");
            Ok(format!("Classifier error: {e}"))
        }
    }
}

fn retrain(ctx: &TaskContext) -> Result<bool> {
    let model_path = ctx.data_dir.classifier_model();
    let mut model = match ClassifierModel::load(&model_path)? {
        Some(model) => model,
        None => {
            tracing::info!("no usable classifier model found, starting fresh");
            ClassifierModel::new()
        }
    };
    if !model.train(&ctx.db)? {
        tracing::debug!("training data unchanged");
        return Ok(false);
    }
    tracing::info!(path = %model_path.display(), "saving updated classifier model");
    model.save(&model_path, &ctx.data_dir.classifier_lock())?;
    Ok(true)
}

/// Removes a temporary file when dropped.
struct TempPath(PathBuf);

impl Drop for TempPath {
    fn drop(&mut self) {
        tracing::debug!(path = %self.0.display(), "deleting converted file");
        if let Err(e) = std::fs::remove_file(&self.0)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.0.display(), error = %e, "failed to delete file");
        }
    }
}

/// Consume an intake file, first splitting it at separator pages when
/// barcode handling is enabled.
///
/// Splitting writes every part back to the intake directory and deletes the
/// original, so it is not safe to retry once the original is gone.
pub fn consume_file(ctx: &TaskContext, request: ConsumeRequest) -> Result<String> {
    if ctx.settings.enable_barcodes
        && let Some(result) = split_at_separators(ctx, &request)?
    {
        return Ok(result);
    }

    match ctx.consumer.try_consume_file(ctx, &request)? {
        Some(doc) => Ok(format!("Success. New document id {} created", doc.id)),
        None => Err(Error::Consumer(CONSUMER_RETURNED_NOTHING.to_string())),
    }
}

fn split_at_separators(
    ctx: &TaskContext,
    request: &ConsumeRequest,
) -> Result<Option<String>> {
    let path = request.path.as_path();
    let mime_type = file_mime_type(path);
    if !ctx.barcodes.supported(&mime_type) {
        tracing::warn!(%mime_type, "unsupported file format for barcode reader");
        return Ok(None);
    }

    let converted = if ctx.barcodes.needs_conversion(&mime_type) {
        Some(TempPath(ctx.barcodes.convert_to_scannable(path)?))
    } else {
        None
    };
    let scannable = converted.as_ref().map_or(path, |c| c.0.as_path());

    let separators = ctx.barcodes.detect(scannable)?;
    if separators.is_empty() {
        return Ok(None);
    }
    tracing::debug!(path = %path.display(), ?separators, "pages with separators found");

    let parts = ctx.barcodes.split(scannable, &separators)?;
    if parts.is_empty() {
        return Err(Error::Barcode(format!(
            "separators found in {} but no pages left to split off",
            path.display()
        )));
    }

    let target_dir = path.parent().unwrap_or_else(|| Path::new("."));
    for (n, part) in parts.iter().enumerate() {
        let name = request.overrides.filename.as_ref().map(|f| format!("{n}_{f}"));
        let written = write_to_intake(part, name.as_deref(), target_dir)?;
        tracing::debug!(path = %written.display(), "saved split document");
    }

    drop(converted);
    tracing::debug!(path = %path.display(), "deleting file");
    std::fs::remove_file(path)?;

    publish_best_effort(
        ctx.notifier.as_ref(),
        &StatusUpdate::finished(
            request.overrides.filename.clone(),
            request.task_id.clone(),
        ),
    );
    Ok(Some(FILE_SUCCESSFULLY_SPLIT.to_string()))
}

/// Log every issue the sanity check finds and map the worst level to the
/// task result.
pub fn sanity_check(ctx: &TaskContext) -> Result<String> {
    let messages = sanity::check_sanity(&ctx.db, &ctx.store)?;
    messages.log_messages();
    messages.outcome()
}

/// Tell listeners the given documents changed, then refresh their index
/// entries in one writer session. Unknown ids are skipped.
pub fn bulk_update_documents(ctx: &TaskContext, document_ids: &[u64]) -> Result<String> {
    let documents = ctx.db.documents_by_ids(document_ids)?;
    let index = ctx.open_index()?;

    for doc in &documents {
        ctx.signals.document_saved(doc, false);
    }

    // Listeners may have changed the records.
    let ids: Vec<u64> = documents.iter().map(|d| d.id).collect();
    let documents = ctx.db.documents_by_ids(&ids)?;
    let updated = index_sync::update_documents(&index, &ctx.settings, &documents)?;
    Ok(format!("Updated {updated} document(s)."))
}

/// Re-create the archive rendition, content and thumbnail of one document.
///
/// A missing record fails the task. A missing parser, any failure while
/// regenerating, and a failed index update are logged and the task still
/// succeeds.
pub fn update_document_archive_file(ctx: &TaskContext, document_id: u64) -> Result<String> {
    let doc = ctx.db.require_document(document_id)?;

    match archiver::regenerate(&ctx.db, &ctx.store, &ctx.parsers, document_id) {
        Ok(Regenerated::Updated(updated)) => {
            let indexed = ctx.open_index().and_then(|index| {
                index_sync::update_document(&index, &ctx.settings, &updated)
            });
            if let Err(e) = indexed {
                tracing::error!(
                    doc_id = document_id,
                    error = %e,
                    "archive regenerated but the index update failed"
                );
            }
            Ok(format!("Archive of {updated} regenerated."))
        }
        Ok(Regenerated::NoParser(doc)) => {
            tracing::error!(
                mime_type = %doc.mime_type,
                "no parser found for mime type, cannot archive document {doc}"
            );
            Ok(format!("No parser for {}, archive unchanged.", doc.mime_type))
        }
        Err(e) => {
            tracing::error!(error = %e, "error while parsing document {doc}");
            Ok(format!("Error while regenerating archive of {doc}."))
        }
    }
}

/// Bring archive renditions and thumbnails flagged by the sanity check back
/// in line with their records.
pub fn repair_archives(ctx: &TaskContext) -> Result<String> {
    let report = repair::repair_archives(&ctx.db, &ctx.store, &ctx.parsers)?;
    if report.regenerated > 0 || report.rolled_forward > 0 {
        let index = ctx.open_index()?;
        let documents = ctx.db.list_documents()?;
        index_sync::update_documents(&index, &ctx.settings, &documents)?;
    }
    Ok(format!("Repair finished: {report}."))
}
