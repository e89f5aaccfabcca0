//! Batch upload pipeline.
//!
//! Files are persisted to the blob sink, recorded as pending uploads and
//! processed by background tasks bounded by a worker pool. Each record moves
//! through its milestones and ends `completed` or `failed`; the batch counts
//! every terminal transition exactly once.

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::knowledge::authority_sync::{CONTACT_CATEGORY, CONTACT_SOURCE};
use crate::knowledge::contacts::ContactService;
use crate::knowledge::KnowledgeManager;
use crate::llm::{ChatMessage, GenerationConfig, LLMManager};
use crate::processing::{inspect_image, DocumentParser};
use crate::rag::structured_output::parse_array;
use crate::storage::Store;
use crate::types::{
    AuthoritativeMedia, BatchStatus, BatchTask, ContactInput, DocumentFormat, Meta, NewDocument,
    Paging, UploadRecord, UploadStatus, UploadType,
};

pub const MEDIA_SOURCE: &str = "authoritative_media";
pub const MEDIA_CATEGORY: &str = "media";
const EXTRACTION_INPUT_CHARS: usize = 6000;

const EXTRACTION_PROMPT: &str = "你是資料擷取助手。請從文件內容中找出所有機構的聯絡資訊，\
只輸出 JSON：{\"contacts\":[{\"name\":\"機構名稱\",\"category\":\"類別\",\"phone\":\"電話\",\
\"email\":\"電子郵件\",\"address\":\"地址\",\"services\":[\"服務項目\"],\"contact_person\":\"聯絡人\",\
\"notes\":\"備註\"}]}。沒有的欄位請省略，不要編造。";

// ── Types ──────────────────────────────────────────────────────────────────

/// Caller-supplied attributes of one uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    #[serde(default)]
    pub relative_path: Option<String>,
    /// `Article` unless the route says otherwise; images always become media.
    #[serde(default)]
    pub upload_type: Option<UploadType>,
    pub category: String,
    pub source: String,
    #[serde(default = "crate::types::default_lang")]
    pub lang: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadAccepted {
    pub upload_id: Uuid,
    pub batch_id: Uuid,
    pub status: UploadStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileStatus {
    pub id: Uuid,
    pub filename: String,
    pub relative_path: Option<String>,
    pub status: UploadStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&UploadRecord> for FileStatus {
    fn from(r: &UploadRecord) -> Self {
        Self {
            id: r.id,
            filename: r.filename.clone(),
            relative_path: r.relative_path.clone(),
            status: r.status,
            progress: r.progress,
            error: r.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusView {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_files: u32,
    pub completed_files: u32,
    pub failed_files: u32,
    pub processing_files: u32,
    pub pending_files: u32,
    pub progress: u8,
    pub created_at: chrono::DateTime<Utc>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub files: Vec<FileStatus>,
}

impl BatchStatusView {
    pub fn project(batch: &BatchTask, records: &[UploadRecord]) -> Self {
        let count = |s: UploadStatus| records.iter().filter(|r| r.status == s).count() as u32;
        let progress = if batch.status == BatchStatus::Completed {
            100
        } else if records.is_empty() {
            0
        } else {
            let sum: u32 = records.iter().map(|r| r.progress as u32).sum();
            (sum / records.len() as u32) as u8
        };
        Self {
            batch_id: batch.id,
            status: batch.status,
            total_files: batch.total_files,
            completed_files: batch.completed_files,
            failed_files: count(UploadStatus::Failed),
            processing_files: count(UploadStatus::Processing),
            pending_files: count(UploadStatus::Pending),
            progress,
            created_at: batch.created_at,
            completed_at: batch.completed_at,
            files: records.iter().map(FileStatus::from).collect(),
        }
    }
}

/// One row of the contact extraction output.
#[derive(Debug, Clone, Default, Deserialize)]
struct ExtractedContact {
    #[serde(default)]
    name: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    services: Option<Value>,
    #[serde(default)]
    contact_person: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

// ── Blob sink ──────────────────────────────────────────────────────────────

/// Uploaded bytes on disk, addressed by `{upload_id}{ext}`.
#[derive(Debug, Clone)]
pub struct BlobSink {
    root: PathBuf,
}

impl BlobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, upload_id: Uuid, filename: &str) -> PathBuf {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        self.root.join(format!("{}{}", upload_id, ext))
    }

    pub async fn write(&self, upload_id: Uuid, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(upload_id, filename);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }
}

// ── Pipeline ───────────────────────────────────────────────────────────────

struct PipelineInner {
    store: Store,
    knowledge: KnowledgeManager,
    contacts: ContactService,
    llm: LLMManager,
    extraction: GenerationConfig,
    parser: DocumentParser,
    blobs: BlobSink,
    workers: Arc<Semaphore>,
    tasks: DashMap<Uuid, JoinHandle<()>>,
    task_timeout: Duration,
}

#[derive(Clone)]
pub struct UploadPipeline {
    inner: Arc<PipelineInner>,
}

impl UploadPipeline {
    pub fn new(
        store: Store,
        knowledge: KnowledgeManager,
        contacts: ContactService,
        llm: LLMManager,
        config: &AppConfig,
    ) -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        let workers = (cpus * config.upload.workers_per_cpu).max(1);
        tracing::info!(workers, blob_dir = %config.upload.blob_dir.display(), "Upload pipeline ready");

        Self {
            inner: Arc::new(PipelineInner {
                store,
                knowledge,
                contacts,
                llm,
                extraction: GenerationConfig {
                    model: Some(config.llm.model_analysis.clone()),
                    max_tokens: 2000,
                    temperature: 0.0,
                    force_json: true,
                    timeout_ms: config.llm.timeout_secs * 1000,
                    ..GenerationConfig::default()
                },
                parser: DocumentParser::new(),
                blobs: BlobSink::new(config.upload.blob_dir.clone()),
                workers: Arc::new(Semaphore::new(workers)),
                tasks: DashMap::new(),
                task_timeout: Duration::from_secs(config.upload.task_timeout_secs),
            }),
        }
    }

    pub async fn create_batch(&self, total_files: u32) -> Result<BatchTask> {
        let batch = self.inner.store.create_batch(total_files).await?;
        tracing::info!(batch_id = %batch.id, total_files, "Batch created");
        Ok(batch)
    }

    /// Persist the file, record it and queue it for processing. Returns as
    /// soon as the task is queued.
    pub async fn upload_file_to_batch(
        &self,
        batch_id: Uuid,
        bytes: Vec<u8>,
        request: UploadRequest,
    ) -> Result<UploadAccepted> {
        let inner = &self.inner;
        inner
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("batch {}", batch_id)))?;

        let filename = request.filename.trim().to_string();
        if filename.is_empty() {
            return Err(Error::Validation("filename is required".into()));
        }
        let format = DocumentFormat::from_filename(&filename);
        let upload_type = classify(format, request.upload_type)?;

        let upload_id = Uuid::new_v4();
        let path = inner.blobs.write(upload_id, &filename, &bytes).await?;
        let now = Utc::now();
        let record = UploadRecord {
            id: upload_id,
            filename: filename.clone(),
            upload_type,
            status: UploadStatus::Pending,
            file_size: Some(bytes.len() as u64),
            mime_type: Some(format.mime_type(&filename).to_string()),
            metadata: Some(as_meta(json!({
                "category": request.category,
                "source": request.source,
                "lang": request.lang,
            }))),
            error: None,
            progress: 0,
            batch_id: Some(batch_id),
            relative_path: request.relative_path.clone(),
            file_path: Some(path.to_string_lossy().to_string()),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = inner.store.insert_upload(record.clone()).await {
            if let Err(io) = tokio::fs::remove_file(&path).await {
                tracing::warn!(upload_id = %upload_id, error = %io, "Rejected upload blob not removed");
            }
            return Err(e);
        }

        self.spawn(record, request);
        tracing::info!(upload_id = %upload_id, batch_id = %batch_id, filename = %filename, upload_type = upload_type.as_str(), "Upload queued");

        Ok(UploadAccepted {
            upload_id,
            batch_id,
            status: UploadStatus::Processing,
        })
    }

    pub async fn batch_status(&self, batch_id: Uuid) -> Result<BatchStatusView> {
        let batch = self
            .inner
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("batch {}", batch_id)))?;
        let records = self.inner.store.uploads_for_batch(batch_id).await?;
        Ok(BatchStatusView::project(&batch, &records))
    }

    pub async fn file_status(&self, upload_id: Uuid) -> Result<UploadRecord> {
        self.inner
            .store
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("upload {}", upload_id)))
    }

    pub async fn list_batches(&self, paging: Paging) -> Result<(Vec<BatchTask>, usize)> {
        self.inner.store.list_batches(paging).await
    }

    /// Remove the batch; its files stay, detached.
    pub async fn delete_batch(&self, batch_id: Uuid) -> Result<()> {
        if !self.inner.store.delete_batch(batch_id).await? {
            return Err(Error::NotFound(format!("batch {}", batch_id)));
        }
        tracing::info!(batch_id = %batch_id, "Batch deleted");
        Ok(())
    }

    /// Wait for every queued and running task.
    pub async fn wait_idle(&self) {
        loop {
            let Some(id) = self.inner.tasks.iter().next().map(|e| *e.key()) else {
                return;
            };
            if let Some((_, handle)) = self.inner.tasks.remove(&id) {
                if let Err(e) = handle.await {
                    tracing::error!(upload_id = %id, error = %e, "Upload task aborted");
                }
            }
        }
    }

    fn spawn(&self, record: UploadRecord, request: UploadRequest) {
        let inner = self.inner.clone();
        let upload_id = record.id;
        inner.tasks.retain(|_, handle| !handle.is_finished());

        let handle = tokio::spawn({
            let inner = inner.clone();
            async move {
                // Queued uploads stay pending until a worker is free.
                let _permit = match inner.workers.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                run_task(&inner, record, request).await;
            }
        });
        inner.tasks.insert(upload_id, handle);
    }
}

// ── Task execution ─────────────────────────────────────────────────────────

async fn run_task(inner: &PipelineInner, record: UploadRecord, request: UploadRequest) {
    let id = record.id;
    match inner.store.mark_upload_processing(id).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            tracing::error!(upload_id = %id, error = %e, "Could not start upload");
            return;
        }
    }

    let work = std::panic::AssertUnwindSafe(process(inner, &record, &request)).catch_unwind();
    let (status, error) = match tokio::time::timeout(inner.task_timeout, work).await {
        Ok(Ok(Ok(()))) => (UploadStatus::Completed, None),
        Ok(Ok(Err(e))) => {
            tracing::warn!(upload_id = %id, filename = %record.filename, error = %e, "Upload failed");
            (UploadStatus::Failed, Some(e.to_string()))
        }
        Ok(Err(panic)) => {
            let msg = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(upload_id = %id, panic = %msg, "Upload task panicked");
            (UploadStatus::Failed, Some(format!("panic: {}", msg)))
        }
        Err(_) => {
            tracing::warn!(upload_id = %id, timeout_secs = inner.task_timeout.as_secs(), "Upload timed out");
            (UploadStatus::Failed, Some("timeout".to_string()))
        }
    };

    match inner.store.finish_upload(id, status, error).await {
        Ok(Some(batch)) if batch.status == BatchStatus::Completed => {
            tracing::info!(batch_id = %batch.id, total_files = batch.total_files, "Batch completed");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(upload_id = %id, error = %e, "Could not finish upload"),
    }
}

async fn process(inner: &PipelineInner, record: &UploadRecord, request: &UploadRequest) -> Result<()> {
    let path = record
        .file_path
        .as_deref()
        .ok_or_else(|| Error::Integrity(format!("upload {} has no file path", record.id)))?;
    let bytes = inner.blobs.read(Path::new(path)).await?;

    match record.upload_type {
        UploadType::Article => process_article(inner, record, request, &bytes).await,
        UploadType::AuthorityMedia => process_media(inner, record, request, &bytes).await,
        UploadType::AuthorityContacts => process_contacts(inner, record, &bytes).await,
    }
}

async fn process_article(
    inner: &PipelineInner,
    record: &UploadRecord,
    request: &UploadRequest,
    bytes: &[u8],
) -> Result<()> {
    let store = &inner.store;
    store.update_upload_progress(record.id, 10).await?;

    let (title, content, parse_error) = match inner.parser.parse_bytes(bytes, &record.filename) {
        Ok(parsed) => (parsed.title, parsed.content, None),
        Err(e) => {
            tracing::warn!(upload_id = %record.id, filename = %record.filename, error = %e, "Parse failed, storing placeholder");
            (
                record.filename.clone(),
                placeholder_content(&record.filename),
                Some(e.to_string()),
            )
        }
    };
    store.update_upload_progress(record.id, 30).await?;

    let new = NewDocument {
        title,
        content,
        source: request.source.clone(),
        category: request.category.clone(),
        lang: request.lang.clone(),
        published_date: None,
    };
    store.update_upload_progress(record.id, 50).await?;

    let doc = inner.knowledge.add_document(new).await?;
    store.update_upload_progress(record.id, 80).await?;

    let mut meta = as_meta(json!({ "document_id": doc.id, "title": doc.title }));
    if let Some(err) = parse_error {
        meta.insert("parse_error".into(), json!(err));
    }
    store.merge_upload_metadata(record.id, meta).await
}

async fn process_media(
    inner: &PipelineInner,
    record: &UploadRecord,
    request: &UploadRequest,
    bytes: &[u8],
) -> Result<()> {
    let store = &inner.store;
    store.update_upload_progress(record.id, 10).await?;

    let info = inspect_image(bytes);
    let mime_type = record
        .mime_type
        .clone()
        .unwrap_or_else(|| DocumentFormat::Image.mime_type(&record.filename).to_string());
    store.update_upload_progress(record.id, 30).await?;

    let tags: Vec<String> = [request.category.trim(), request.source.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    let dimensions = match (info.width, info.height) {
        (Some(w), Some(h)) => format!("{}x{}", w, h),
        _ => "未知".to_string(),
    };
    let description = format!("{}（{}，{}）", record.filename, mime_type, dimensions);
    let media = AuthoritativeMedia {
        id: Uuid::new_v4(),
        upload_id: Some(record.id),
        filename: record.filename.clone(),
        mime_type: mime_type.clone(),
        file_size: bytes.len() as u64,
        width: info.width,
        height: info.height,
        format: info.format.clone(),
        tags: tags.clone(),
        description: description.clone(),
        created_at: Utc::now(),
    };
    store.insert_media(media.clone()).await?;
    store.update_upload_progress(record.id, 50).await?;

    let mut content = format!("媒體檔案：{}\n類型：{}\n尺寸：{}", record.filename, mime_type, dimensions);
    if !tags.is_empty() {
        content.push_str(&format!("\n標籤：{}", tags.join("、")));
    }
    let (doc, _) = inner
        .knowledge
        .upsert_by_title(NewDocument {
            title: format!("媒體: {}", record.filename),
            content,
            source: MEDIA_SOURCE.to_string(),
            category: MEDIA_CATEGORY.to_string(),
            lang: request.lang.clone(),
            published_date: None,
        })
        .await?;
    store.update_upload_progress(record.id, 80).await?;

    store
        .merge_upload_metadata(
            record.id,
            as_meta(json!({
                "media_id": media.id,
                "document_id": doc.id,
                "width": info.width,
                "height": info.height,
                "format": info.format,
            })),
        )
        .await
}

async fn process_contacts(inner: &PipelineInner, record: &UploadRecord, bytes: &[u8]) -> Result<()> {
    let store = &inner.store;
    store.update_upload_progress(record.id, 10).await?;

    let parsed = inner.parser.parse_bytes(bytes, &record.filename)?;
    store.update_upload_progress(record.id, 20).await?;

    let excerpt: String = parsed.content.chars().take(EXTRACTION_INPUT_CHARS).collect();
    let messages = [
        ChatMessage::system(EXTRACTION_PROMPT),
        ChatMessage::user(format!("檔名：{}\n\n{}", record.filename, excerpt)),
    ];
    let raw = inner.llm.generate(&messages, &inner.extraction).await?;
    store.update_upload_progress(record.id, 30).await?;

    let rows: Vec<ExtractedContact> = parse_array(&raw, "contacts")
        .ok_or_else(|| Error::External("contact extraction returned no JSON array".into()))?
        .into_iter()
        .filter_map(|v| serde_json::from_value::<ExtractedContact>(v).ok())
        .filter(|c| !c.name.trim().is_empty())
        .collect();
    store.update_upload_progress(record.id, 50).await?;

    let mut contact_ids = Vec::new();
    for row in &rows {
        let (contact, _) = inner.contacts.upsert_by_organisation(contact_input(row)).await?;
        contact_ids.push(contact.id);
    }
    store.update_upload_progress(record.id, 70).await?;

    let mut document_ids = Vec::new();
    for row in &rows {
        let (doc, _) = inner
            .knowledge
            .upsert_by_title(NewDocument {
                title: format!("機構: {}", row.name.trim()),
                content: describe_contact(row),
                source: CONTACT_SOURCE.to_string(),
                category: CONTACT_CATEGORY.to_string(),
                lang: crate::types::default_lang(),
                published_date: None,
            })
            .await?;
        document_ids.push(doc.id);
    }
    store.update_upload_progress(record.id, 90).await?;

    if rows.is_empty() {
        tracing::warn!(upload_id = %record.id, "No contacts extracted");
    }
    store
        .merge_upload_metadata(
            record.id,
            as_meta(json!({
                "contacts_count": rows.len(),
                "contact_ids": contact_ids,
                "document_ids": document_ids,
            })),
        )
        .await
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn classify(format: DocumentFormat, requested: Option<UploadType>) -> Result<UploadType> {
    match (format, requested) {
        (DocumentFormat::Image, Some(UploadType::AuthorityContacts)) => Err(Error::Validation(
            "contact uploads must be documents, not images".into(),
        )),
        (DocumentFormat::Image, _) => Ok(UploadType::AuthorityMedia),
        (DocumentFormat::Unknown, _) => Err(Error::Validation("unsupported file type".into())),
        (_, Some(UploadType::AuthorityMedia)) => Err(Error::Validation(
            "media uploads must be images".into(),
        )),
        (_, requested) => Ok(requested.unwrap_or(UploadType::Article)),
    }
}

pub fn placeholder_content(filename: &str) -> String {
    format!("[檔案] {}（內容無法自動解析）", filename)
}

fn contact_input(row: &ExtractedContact) -> ContactInput {
    let clean = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(String::from);
    let mut tags = services(row);
    if let Some(category) = clean(&row.category) {
        if !tags.contains(&category) {
            tags.insert(0, category);
        }
    }
    let notes = match (clean(&row.notes), clean(&row.contact_person)) {
        (Some(n), Some(p)) => Some(format!("{}（聯絡人：{}）", n, p)),
        (Some(n), None) => Some(n),
        (None, Some(p)) => Some(format!("聯絡人：{}", p)),
        (None, None) => None,
    };
    ContactInput {
        organisation: row.name.trim().to_string(),
        phone: clean(&row.phone),
        email: clean(&row.email),
        address: clean(&row.address),
        tags: if tags.is_empty() { None } else { Some(tags) },
        notes,
    }
}

fn services(row: &ExtractedContact) -> Vec<String> {
    match &row.services {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::String(s)) => s
            .split(|c| matches!(c, ',' | '，' | '、'))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Natural-language description indexed for retrieval.
fn describe_contact(row: &ExtractedContact) -> String {
    let mut text = row.name.trim().to_string();
    if let Some(category) = row.category.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("是{}", category.trim()));
    }
    text.push('。');
    let services = services(row);
    if !services.is_empty() {
        text.push_str(&format!("提供{}等服務。", services.join("、")));
    }
    if let Some(address) = row.address.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("地址：{}。", address.trim()));
    }
    if let Some(phone) = row.phone.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("電話：{}。", phone.trim()));
    }
    if let Some(email) = row.email.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("電子郵件：{}。", email.trim()));
    }
    if let Some(person) = row.contact_person.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("聯絡人：{}。", person.trim()));
    }
    if let Some(notes) = row.notes.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(notes.trim());
    }
    text
}

fn as_meta(value: Value) -> Meta {
    match value {
        Value::Object(map) => map,
        _ => Meta::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::authority_sync::{contact_title, AuthoritySync};
    use crate::llm::LLMProvider;
    use crate::test_support::{ConceptEmbedder, FailingLLM, ScriptedLLM};
    use std::io::Cursor;
    use tempfile::TempDir;

    struct Harness {
        pipeline: UploadPipeline,
        store: Store,
        _dir: TempDir,
    }

    fn harness_with(llm: Arc<dyn LLMProvider>, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.upload.blob_dir = dir.path().join("blobs");
        tweak(&mut config);

        let store = Store::open_in_memory().unwrap();
        let knowledge = KnowledgeManager::new(store.clone(), Arc::new(ConceptEmbedder::new()), &config);
        let contacts = ContactService::new(store.clone(), AuthoritySync::new(knowledge.clone()));
        let pipeline = UploadPipeline::new(store.clone(), knowledge, contacts, LLMManager::new(llm), &config);
        Harness { pipeline, store, _dir: dir }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(FailingLLM), |_| {})
    }

    fn request(filename: &str) -> UploadRequest {
        UploadRequest {
            filename: filename.into(),
            relative_path: Some(format!("docs/{}", filename)),
            upload_type: None,
            category: "education".into(),
            source: "admin".into(),
            lang: "zh-TW".into(),
        }
    }

    fn png() -> Vec<u8> {
        let img = image::RgbImage::new(4, 3);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn batch_of_pdfs_and_image_completes() {
        let h = harness();
        let batch = h.pipeline.create_batch(3).await.unwrap();

        for (name, bytes) in [
            ("講義一.pdf", b"%PDF-1.4 not really a pdf".to_vec()),
            ("講義二.pdf", b"garbage".to_vec()),
            ("海報.png", png()),
        ] {
            let accepted = h
                .pipeline
                .upload_file_to_batch(batch.id, bytes, request(name))
                .await
                .unwrap();
            assert_eq!(accepted.status, UploadStatus::Processing);
        }
        h.pipeline.wait_idle().await;

        let status = h.pipeline.batch_status(batch.id).await.unwrap();
        assert_eq!(status.status, BatchStatus::Completed);
        assert_eq!(status.completed_files, 3);
        assert_eq!(status.progress, 100);
        assert!(status.completed_at.is_some());
        assert_eq!(status.files.len(), 3);
        for file in &status.files {
            assert_eq!(file.status, UploadStatus::Completed);
            assert_eq!(file.progress, 100);
        }

        let media = h.store.list_media().await.unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!((media[0].width, media[0].height), (Some(4), Some(3)));
        assert!(h.store.find_document(MEDIA_SOURCE, "媒體: 海報.png").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unparseable_file_becomes_placeholder_document() {
        let h = harness();
        let batch = h.pipeline.create_batch(1).await.unwrap();
        let accepted = h
            .pipeline
            .upload_file_to_batch(batch.id, b"garbage".to_vec(), request("壞檔.pdf"))
            .await
            .unwrap();
        h.pipeline.wait_idle().await;

        let record = h.pipeline.file_status(accepted.upload_id).await.unwrap();
        let meta = record.metadata.unwrap();
        assert!(meta.contains_key("parse_error"));
        let doc = h.store.find_document("admin", "壞檔.pdf").await.unwrap().unwrap();
        assert_eq!(doc.content, placeholder_content("壞檔.pdf"));
    }

    #[tokio::test]
    async fn upload_past_batch_size_is_rejected_and_blob_removed() {
        let h = harness();
        let batch = h.pipeline.create_batch(1).await.unwrap();
        h.pipeline
            .upload_file_to_batch(batch.id, png(), request("第一張.png"))
            .await
            .unwrap();
        h.pipeline.wait_idle().await;

        let extra = h
            .pipeline
            .upload_file_to_batch(batch.id, png(), request("第二張.png"))
            .await;
        assert!(matches!(extra, Err(Error::Validation(_))));

        let status = h.pipeline.batch_status(batch.id).await.unwrap();
        assert_eq!(status.status, BatchStatus::Completed);
        assert_eq!(status.completed_files, 1);
        assert_eq!(status.files.len(), 1);
        let blobs = std::fs::read_dir(h._dir.path().join("blobs")).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[tokio::test]
    async fn text_article_is_indexed_with_request_fields() {
        let h = harness();
        let batch = h.pipeline.create_batch(1).await.unwrap();
        let accepted = h
            .pipeline
            .upload_file_to_batch(batch.id, "戒毒門診每週一開放".as_bytes().to_vec(), request("門診.txt"))
            .await
            .unwrap();
        h.pipeline.wait_idle().await;

        let record = h.pipeline.file_status(accepted.upload_id).await.unwrap();
        assert_eq!(record.status, UploadStatus::Completed);
        assert_eq!(record.relative_path.as_deref(), Some("docs/門診.txt"));
        let doc = h.store.find_document("admin", "門診").await.unwrap().unwrap();
        assert_eq!(doc.category, "education");
        assert!(h.store.count_chunks(doc.id).await.unwrap() > 0);

        let blob = record.file_path.unwrap();
        assert!(blob.ends_with(&format!("{}.txt", accepted.upload_id)));
    }

    #[tokio::test]
    async fn contact_sheet_is_extracted_and_synced() {
        let llm = ScriptedLLM::new().on(
            "資料擷取助手",
            r#"{"contacts":[{"name":"凱旋醫院","category":"醫療院所","phone":"07-751-3171","services":["戒癮門診","心理諮商"]},{"name":""}]}"#,
        );
        let h = harness_with(Arc::new(llm), |_| {});
        let batch = h.pipeline.create_batch(1).await.unwrap();
        let mut req = request("機構.csv");
        req.upload_type = Some(UploadType::AuthorityContacts);
        let accepted = h
            .pipeline
            .upload_file_to_batch(batch.id, "機構,電話\n凱旋醫院,07-751-3171\n".as_bytes().to_vec(), req)
            .await
            .unwrap();
        h.pipeline.wait_idle().await;

        let record = h.pipeline.file_status(accepted.upload_id).await.unwrap();
        assert_eq!(record.status, UploadStatus::Completed);
        assert_eq!(record.metadata.unwrap()["contacts_count"], json!(1));

        let contact = h.store.get_contact_by_organisation("凱旋醫院").await.unwrap().unwrap();
        assert_eq!(contact.tags.unwrap(), vec!["醫療院所", "戒癮門診", "心理諮商"]);
        assert!(h.store.find_document(CONTACT_SOURCE, &contact_title("凱旋醫院")).await.unwrap().is_some());
        let described = h.store.find_document(CONTACT_SOURCE, "機構: 凱旋醫院").await.unwrap().unwrap();
        assert!(described.content.contains("電話：07-751-3171"));
    }

    #[tokio::test]
    async fn failed_extraction_still_counts_toward_batch() {
        let h = harness();
        let batch = h.pipeline.create_batch(1).await.unwrap();
        let mut req = request("機構.txt");
        req.upload_type = Some(UploadType::AuthorityContacts);
        let accepted = h
            .pipeline
            .upload_file_to_batch(batch.id, "凱旋醫院 07-751-3171".as_bytes().to_vec(), req)
            .await
            .unwrap();
        h.pipeline.wait_idle().await;

        let record = h.pipeline.file_status(accepted.upload_id).await.unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        assert!(record.progress < 100);
        assert!(record.error.is_some());

        let status = h.pipeline.batch_status(batch.id).await.unwrap();
        assert_eq!(status.status, BatchStatus::Completed);
        assert_eq!(status.failed_files, 1);
    }

    #[tokio::test]
    async fn unsupported_extension_is_rejected() {
        let h = harness();
        let batch = h.pipeline.create_batch(1).await.unwrap();
        let result = h
            .pipeline
            .upload_file_to_batch(batch.id, vec![1, 2, 3], request("程式.exe"))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let h = harness();
        let result = h
            .pipeline
            .upload_file_to_batch(Uuid::new_v4(), b"x".to_vec(), request("a.txt"))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn deleting_batch_detaches_files() {
        let h = harness();
        let batch = h.pipeline.create_batch(1).await.unwrap();
        let accepted = h
            .pipeline
            .upload_file_to_batch(batch.id, b"hello".to_vec(), request("a.txt"))
            .await
            .unwrap();
        h.pipeline.wait_idle().await;

        h.pipeline.delete_batch(batch.id).await.unwrap();
        let record = h.pipeline.file_status(accepted.upload_id).await.unwrap();
        assert!(record.batch_id.is_none());
        assert!(matches!(h.pipeline.delete_batch(batch.id).await, Err(Error::NotFound(_))));
    }

    #[test]
    fn projection_averages_progress_until_complete() {
        let now = Utc::now();
        let batch = BatchTask {
            id: Uuid::new_v4(),
            total_files: 2,
            completed_files: 1,
            status: BatchStatus::InProgress,
            created_at: now,
            completed_at: None,
        };
        let record = |status, progress| UploadRecord {
            id: Uuid::new_v4(),
            filename: "f.txt".into(),
            upload_type: UploadType::Article,
            status,
            file_size: None,
            mime_type: None,
            metadata: None,
            error: None,
            progress,
            batch_id: Some(batch.id),
            relative_path: None,
            file_path: None,
            created_at: now,
            updated_at: now,
        };
        let view = BatchStatusView::project(
            &batch,
            &[record(UploadStatus::Completed, 100), record(UploadStatus::Processing, 30)],
        );
        assert_eq!(view.progress, 65);
        assert_eq!(view.processing_files, 1);
        assert_eq!(view.pending_files, 0);
    }
}
