use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type Meta = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl Turn {
    pub fn user(content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            created_at,
            meta: None,
        }
    }

    pub fn assistant(content: impl Into<String>, created_at: DateTime<Utc>, meta: Meta) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            content: content.into(),
            created_at,
            meta: Some(meta),
        }
    }

    /// Care stage recorded on an assistant turn, if any.
    pub fn care_stage(&self) -> Option<u8> {
        self.meta
            .as_ref()?
            .get("care_stage")?
            .as_u64()
            .and_then(|s| u8::try_from(s).ok())
            .filter(|s| (1..=3).contains(s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub source: String,
    pub category: String,
    pub lang: String,
    pub published_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a knowledge document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub title: String,
    pub content: String,
    pub source: String,
    pub category: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub published_date: Option<NaiveDate>,
}

pub fn default_lang() -> String {
    "zh-TW".to_string()
}

/// Partial update. `content: Some(..)` triggers a full rechunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub source: Option<String>,
    pub category: Option<String>,
    pub lang: Option<String>,
    pub published_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub document_id: Uuid,
    pub chunk_index: usize,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub document_id: Uuid,
    pub chunk_index: usize,
    pub content: String,
    pub title: String,
    pub source: String,
    pub category: String,
    pub similarity: f32,
    pub metadata: HashMap<String, String>,
}

/// Optional equality filters applied to document listing and retrieval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentFilter {
    pub category: Option<String>,
    pub lang: Option<String>,
    pub source: Option<String>,
}

impl DocumentFilter {
    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    /// Build a parameterised `AND` clause over the documents table alias `d`,
    /// numbering placeholders from `?{first_param}`. Returns an empty clause
    /// when no filter is set.
    pub fn to_sql_predicate(&self, first_param: usize) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for (column, value) in [
            ("category", &self.category),
            ("lang", &self.lang),
            ("source", &self.source),
        ] {
            if let Some(v) = value {
                params.push(v.clone());
                clauses.push(format!("d.{} = ?{}", column, first_param + params.len() - 1));
            }
        }
        (clauses.join(" AND "), params)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Paging {
    pub skip: usize,
    pub limit: usize,
}

impl Default for Paging {
    fn default() -> Self {
        Self { skip: 0, limit: 50 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadType {
    Article,
    AuthorityMedia,
    AuthorityContacts,
}

impl UploadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadType::Article => "article",
            UploadType::AuthorityMedia => "authority_media",
            UploadType::AuthorityContacts => "authority_contacts",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "article" => Some(UploadType::Article),
            "authority_media" => Some(UploadType::AuthorityMedia),
            "authority_contacts" => Some(UploadType::AuthorityContacts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(UploadStatus::Pending),
            "processing" => Some(UploadStatus::Processing),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub filename: String,
    pub upload_type: UploadType,
    pub status: UploadStatus,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub metadata: Option<Meta>,
    pub error: Option<String>,
    pub progress: u8,
    pub batch_id: Option<Uuid>,
    pub relative_path: Option<String>,
    pub file_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(BatchStatus::Pending),
            "in_progress" => Some(BatchStatus::InProgress),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTask {
    pub id: Uuid,
    pub total_files: u32,
    pub completed_files: u32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritativeContact {
    pub id: Uuid,
    pub organisation: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub tags: Option<Vec<String>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied contact fields for create/update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactInput {
    pub organisation: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritativeMedia {
    pub id: Uuid,
    pub upload_id: Option<Uuid>,
    pub filename: String,
    pub mime_type: String,
    pub file_size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub tags: Vec<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DocumentFormat {
    Txt,
    Markdown,
    Html,
    Json,
    Csv,
    Spreadsheet,
    Pdf,
    Word,
    Image,
    Unknown,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "txt" | "text" | "log" => Self::Txt,
            "md" | "markdown" => Self::Markdown,
            "html" | "htm" => Self::Html,
            "json" => Self::Json,
            "csv" | "tsv" => Self::Csv,
            "xlsx" | "xls" | "xlsm" | "ods" => Self::Spreadsheet,
            "pdf" => Self::Pdf,
            "docx" | "doc" => Self::Word,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tif" | "tiff" => Self::Image,
            _ => Self::Unknown,
        }
    }

    pub fn from_filename(filename: &str) -> Self {
        std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::Unknown)
    }

    pub fn mime_type(&self, filename: &str) -> &'static str {
        let ext = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match self {
            Self::Txt => "text/plain",
            Self::Markdown => "text/markdown",
            Self::Html => "text/html",
            Self::Json => "application/json",
            Self::Csv => "text/csv",
            Self::Spreadsheet => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            Self::Pdf => "application/pdf",
            Self::Word => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Self::Image => match ext.as_str() {
                "png" => "image/png",
                "gif" => "image/gif",
                "webp" => "image/webp",
                "bmp" => "image/bmp",
                "tif" | "tiff" => "image/tiff",
                _ => "image/jpeg",
            },
            Self::Unknown => "application/octet-stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_builds_numbered_params() {
        let filter = DocumentFilter {
            category: Some("contacts".into()),
            lang: None,
            source: Some("authoritative_contacts".into()),
        };
        let (clause, params) = filter.to_sql_predicate(1);
        assert_eq!(clause, "d.category = ?1 AND d.source = ?2");
        assert_eq!(params, vec!["contacts", "authoritative_contacts"]);

        let (clause, _) = filter.to_sql_predicate(9);
        assert_eq!(clause, "d.category = ?9 AND d.source = ?10");

        let (clause, params) = DocumentFilter::default().to_sql_predicate(1);
        assert!(clause.is_empty());
        assert!(params.is_empty());
    }

    #[test]
    fn format_detection_by_filename() {
        assert_eq!(DocumentFormat::from_filename("report.PDF"), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_filename("poster.png"), DocumentFormat::Image);
        assert_eq!(DocumentFormat::from_filename("list.xlsx"), DocumentFormat::Spreadsheet);
        assert_eq!(DocumentFormat::from_filename("noext"), DocumentFormat::Unknown);
        assert_eq!(DocumentFormat::Image.mime_type("a.png"), "image/png");
    }

    #[test]
    fn care_stage_read_from_meta() {
        let mut meta = Meta::new();
        meta.insert("care_stage".into(), serde_json::json!(2));
        let turn = Turn::assistant("好", Utc::now(), meta);
        assert_eq!(turn.care_stage(), Some(2));
        assert_eq!(Turn::user("hi", Utc::now()).care_stage(), None);
    }
}
