pub mod batch;
pub mod chat;
pub mod contacts;
pub mod conversations;
pub mod drug;
pub mod knowledge;

use axum::extract::Multipart;
use serde::Deserialize;

use careline::types::Paging;

use crate::api_error::ApiError;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl PageQuery {
    pub fn paging(&self) -> Paging {
        let default = Paging::default();
        Paging {
            skip: self.skip.unwrap_or(default.skip),
            limit: self.limit.unwrap_or(default.limit).clamp(1, 500),
        }
    }
}

/// Multipart body split into the `file` part and plain text fields.
pub struct UploadForm {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub fields: Vec<(String, String)>,
}

impl UploadForm {
    pub fn field(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

pub async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut file = None;
    let mut fields = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed to read file: {}", e)))?;
            file = Some((filename, bytes.to_vec()));
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed to read field {}: {}", name, e)))?;
            fields.push((name, value));
        }
    }

    let (filename, bytes) = file.ok_or_else(|| ApiError::bad_request("missing file part"))?;
    if filename.trim().is_empty() {
        return Err(ApiError::bad_request("file part has no filename"));
    }
    Ok(UploadForm {
        filename,
        bytes,
        fields,
    })
}
