use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{from_micros, json_col, micros, opt_uuid_col, uuid_col, Store};
use crate::error::{Error, Result};
use crate::types::{
    AuthoritativeMedia, BatchStatus, BatchTask, Meta, Paging, UploadRecord, UploadStatus,
    UploadType,
};

const UPLOAD_COLUMNS: &str = "id, filename, upload_type, status, file_size, mime_type, metadata, \
     error, progress, batch_id, relative_path, file_path, created_at, updated_at";

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<BatchTask> {
    let status: String = row.get(3)?;
    Ok(BatchTask {
        id: uuid_col(row, 0)?,
        total_files: row.get(1)?,
        completed_files: row.get(2)?,
        status: BatchStatus::parse(&status).unwrap_or(BatchStatus::Pending),
        created_at: from_micros(row.get(4)?),
        completed_at: row.get::<_, Option<i64>>(5)?.map(from_micros),
    })
}

fn upload_from_row(row: &Row<'_>) -> rusqlite::Result<UploadRecord> {
    let upload_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(UploadRecord {
        id: uuid_col(row, 0)?,
        filename: row.get(1)?,
        upload_type: UploadType::parse(&upload_type).unwrap_or(UploadType::Article),
        status: UploadStatus::parse(&status).unwrap_or(UploadStatus::Pending),
        file_size: row.get::<_, Option<i64>>(4)?.map(|s| s as u64),
        mime_type: row.get(5)?,
        metadata: json_col(row, 6)?,
        error: row.get(7)?,
        progress: row.get::<_, i64>(8)?.clamp(0, 100) as u8,
        batch_id: opt_uuid_col(row, 9)?,
        relative_path: row.get(10)?,
        file_path: row.get(11)?,
        created_at: from_micros(row.get(12)?),
        updated_at: from_micros(row.get(13)?),
    })
}

fn load_batch(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<BatchTask>> {
    conn.query_row(
        "SELECT id, total_files, completed_files, status, created_at, completed_at
         FROM batch_tasks WHERE id = ?1",
        params![id.to_string()],
        batch_from_row,
    )
    .optional()
}

impl Store {
    pub async fn create_batch(&self, total_files: u32) -> Result<BatchTask> {
        if total_files == 0 {
            return Err(Error::Validation("file_count must be > 0".into()));
        }
        self.call(move |conn| {
            let batch = BatchTask {
                id: Uuid::new_v4(),
                total_files,
                completed_files: 0,
                status: BatchStatus::Pending,
                created_at: Utc::now(),
                completed_at: None,
            };
            conn.execute(
                "INSERT INTO batch_tasks (id, total_files, completed_files, status, created_at)
                 VALUES (?1, ?2, 0, ?3, ?4)",
                params![
                    batch.id.to_string(),
                    batch.total_files,
                    batch.status.as_str(),
                    micros(&batch.created_at)
                ],
            )?;
            Ok(batch)
        })
        .await
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<Option<BatchTask>> {
        self.call(move |conn| Ok(load_batch(conn, id)?)).await
    }

    pub async fn list_batches(&self, paging: Paging) -> Result<(Vec<BatchTask>, usize)> {
        self.call(move |conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM batch_tasks", [], |r| r.get(0))?;
            let mut stmt = conn.prepare(
                "SELECT id, total_files, completed_files, status, created_at, completed_at
                 FROM batch_tasks ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let batches = stmt
                .query_map(params![paging.limit as i64, paging.skip as i64], batch_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((batches, total as usize))
        })
        .await
    }

    /// Remove the batch row. Its uploads stay, with `batch_id` cleared.
    pub async fn delete_batch(&self, id: Uuid) -> Result<bool> {
        self.call(move |conn| {
            let n = conn.execute("DELETE FROM batch_tasks WHERE id = ?1", params![id.to_string()])?;
            Ok(n > 0)
        })
        .await
    }

    /// Insert a record. A record bound to a batch is only accepted while the
    /// batch is open and has room left; the check and the insert share one
    /// transaction.
    pub async fn insert_upload(&self, record: UploadRecord) -> Result<()> {
        self.call(move |conn| {
            let metadata = record.metadata.as_ref().map(serde_json::to_string).transpose()?;
            let tx = conn.transaction()?;
            if let Some(batch_id) = record.batch_id {
                let batch = load_batch(&tx, batch_id)?
                    .ok_or_else(|| Error::NotFound(format!("batch {}", batch_id)))?;
                if batch.status == BatchStatus::Completed {
                    return Err(Error::Validation(format!("batch {} is already completed", batch_id)));
                }
                let attached: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM upload_records WHERE batch_id = ?1",
                    params![batch_id.to_string()],
                    |r| r.get(0),
                )?;
                if attached >= i64::from(batch.total_files) {
                    return Err(Error::Validation(format!(
                        "batch {} already holds its {} files",
                        batch_id, batch.total_files
                    )));
                }
            }
            tx.execute(
                &format!(
                    "INSERT INTO upload_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    UPLOAD_COLUMNS
                ),
                params![
                    record.id.to_string(),
                    record.filename,
                    record.upload_type.as_str(),
                    record.status.as_str(),
                    record.file_size.map(|s| s as i64),
                    record.mime_type,
                    metadata,
                    record.error,
                    record.progress as i64,
                    record.batch_id.map(|b| b.to_string()),
                    record.relative_path,
                    record.file_path,
                    micros(&record.created_at),
                    micros(&record.updated_at),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_upload(&self, id: Uuid) -> Result<Option<UploadRecord>> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM upload_records WHERE id = ?1", UPLOAD_COLUMNS),
                    params![id.to_string()],
                    upload_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn uploads_for_batch(&self, batch_id: Uuid) -> Result<Vec<UploadRecord>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM upload_records WHERE batch_id = ?1 ORDER BY created_at ASC",
                UPLOAD_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![batch_id.to_string()], upload_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// `pending -> processing`. Also moves a pending batch to in-progress.
    /// Returns false when the record was not pending.
    pub async fn mark_upload_processing(&self, id: Uuid) -> Result<bool> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = micros(&Utc::now());
            let n = tx.execute(
                "UPDATE upload_records SET status = 'processing', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), now],
            )?;
            if n == 1 {
                tx.execute(
                    "UPDATE batch_tasks SET status = 'in_progress'
                     WHERE status = 'pending'
                       AND id = (SELECT batch_id FROM upload_records WHERE id = ?1)",
                    params![id.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(n == 1)
        })
        .await
    }

    /// Raise progress while processing. Never lowers it and never reaches 100;
    /// only completion sets 100.
    pub async fn update_upload_progress(&self, id: Uuid, progress: u8) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE upload_records
                 SET progress = MIN(MAX(progress, ?2), 99), updated_at = ?3
                 WHERE id = ?1 AND status = 'processing'",
                params![id.to_string(), progress as i64, micros(&Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    /// Merge keys into the record's metadata.
    pub async fn merge_upload_metadata(&self, id: Uuid, extra: Meta) -> Result<()> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<Option<String>> = tx
                .query_row(
                    "SELECT metadata FROM upload_records WHERE id = ?1",
                    params![id.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Err(Error::NotFound(format!("upload {}", id)));
            };
            let mut meta: Meta = current
                .as_deref()
                .map(serde_json::from_str::<Meta>)
                .transpose()?
                .unwrap_or_default();
            meta.extend(extra);
            tx.execute(
                "UPDATE upload_records SET metadata = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), serde_json::to_string(&meta)?, micros(&Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Move a record to a terminal state and count it against its batch in
    /// the same transaction. A record that is already terminal is left alone
    /// and the batch is not counted twice.
    pub async fn finish_upload(
        &self,
        id: Uuid,
        status: UploadStatus,
        error: Option<String>,
    ) -> Result<Option<BatchTask>> {
        if !status.is_terminal() {
            return Err(Error::Validation(format!(
                "{} is not a terminal upload status",
                status.as_str()
            )));
        }
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = micros(&Utc::now());
            let changed = tx.execute(
                "UPDATE upload_records
                 SET status = ?2,
                     error = ?3,
                     progress = CASE WHEN ?2 = 'completed' THEN 100 ELSE MIN(progress, 99) END,
                     updated_at = ?4
                 WHERE id = ?1 AND status IN ('pending', 'processing')",
                params![id.to_string(), status.as_str(), error, now],
            )?;

            let batch_id: Option<String> = if changed == 1 {
                tx.query_row(
                    "SELECT batch_id FROM upload_records WHERE id = ?1",
                    params![id.to_string()],
                    |r| r.get(0),
                )?
            } else {
                None
            };

            let mut batch = None;
            if let Some(batch_id) = batch_id {
                tx.execute(
                    "UPDATE batch_tasks
                     SET completed_files = MIN(completed_files + 1, total_files),
                         status = CASE WHEN completed_files + 1 >= total_files
                                       THEN 'completed' ELSE 'in_progress' END,
                         completed_at = CASE WHEN completed_files + 1 >= total_files
                                             THEN ?2 ELSE NULL END
                     WHERE id = ?1 AND status != 'completed'",
                    params![batch_id, now],
                )?;
                let parsed = Uuid::parse_str(&batch_id)
                    .map_err(|e| Error::Integrity(format!("bad batch id {}: {}", batch_id, e)))?;
                batch = load_batch(&tx, parsed)?;
            }
            tx.commit()?;
            Ok(batch)
        })
        .await
    }

    pub async fn insert_media(&self, media: AuthoritativeMedia) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO authoritative_media
                 (id, upload_id, filename, mime_type, file_size, width, height, format, tags, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    media.id.to_string(),
                    media.upload_id.map(|u| u.to_string()),
                    media.filename,
                    media.mime_type,
                    media.file_size as i64,
                    media.width,
                    media.height,
                    media.format,
                    serde_json::to_string(&media.tags)?,
                    media.description,
                    micros(&media.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_media(&self) -> Result<Vec<AuthoritativeMedia>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, upload_id, filename, mime_type, file_size, width, height, format, tags, description, created_at
                 FROM authoritative_media ORDER BY created_at DESC",
            )?;
            let media = stmt
                .query_map([], |row| {
                    Ok(AuthoritativeMedia {
                        id: uuid_col(row, 0)?,
                        upload_id: opt_uuid_col(row, 1)?,
                        filename: row.get(2)?,
                        mime_type: row.get(3)?,
                        file_size: row.get::<_, i64>(4)? as u64,
                        width: row.get(5)?,
                        height: row.get(6)?,
                        format: row.get(7)?,
                        tags: json_col(row, 8)?.unwrap_or_default(),
                        description: row.get(9)?,
                        created_at: from_micros(row.get(10)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(media)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(batch_id: Option<Uuid>, name: &str) -> UploadRecord {
        let now = Utc::now();
        UploadRecord {
            id: Uuid::new_v4(),
            filename: name.into(),
            upload_type: UploadType::Article,
            status: UploadStatus::Pending,
            file_size: Some(10),
            mime_type: None,
            metadata: None,
            error: None,
            progress: 0,
            batch_id,
            relative_path: None,
            file_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn batch_completes_when_all_files_terminal() {
        let store = Store::open_in_memory().unwrap();
        let batch = store.create_batch(2).await.unwrap();
        let a = record(Some(batch.id), "a.txt");
        let b = record(Some(batch.id), "b.txt");
        let (ida, idb) = (a.id, b.id);
        store.insert_upload(a).await.unwrap();
        store.insert_upload(b).await.unwrap();

        assert!(store.mark_upload_processing(ida).await.unwrap());
        let after_one = store
            .finish_upload(ida, UploadStatus::Completed, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_one.completed_files, 1);
        assert_eq!(after_one.status, BatchStatus::InProgress);
        assert!(after_one.completed_at.is_none());

        store.mark_upload_processing(idb).await.unwrap();
        let done = store
            .finish_upload(idb, UploadStatus::Failed, Some("timeout".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.completed_files, 2);
        assert_eq!(done.status, BatchStatus::Completed);
        assert!(done.completed_at.is_some());

        let failed = store.get_upload(idb).await.unwrap().unwrap();
        assert_eq!(failed.status, UploadStatus::Failed);
        assert!(failed.progress < 100);
    }

    #[tokio::test]
    async fn full_or_completed_batch_rejects_uploads() {
        let store = Store::open_in_memory().unwrap();
        let batch = store.create_batch(1).await.unwrap();
        let first = record(Some(batch.id), "a.png");
        let id = first.id;
        store.insert_upload(first).await.unwrap();

        let extra = store.insert_upload(record(Some(batch.id), "b.png")).await;
        assert!(matches!(extra, Err(Error::Validation(_))));

        store.finish_upload(id, UploadStatus::Completed, None).await.unwrap();
        let late = store.insert_upload(record(Some(batch.id), "c.png")).await;
        assert!(matches!(late, Err(Error::Validation(_))));
        assert_eq!(store.uploads_for_batch(batch.id).await.unwrap().len(), 1);

        let missing = store.insert_upload(record(Some(Uuid::new_v4()), "d.png")).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
        store.insert_upload(record(None, "loose.txt")).await.unwrap();
    }

    #[tokio::test]
    async fn finishing_twice_counts_once() {
        let store = Store::open_in_memory().unwrap();
        let batch = store.create_batch(3).await.unwrap();
        let r = record(Some(batch.id), "a.txt");
        let id = r.id;
        store.insert_upload(r).await.unwrap();
        store.finish_upload(id, UploadStatus::Completed, None).await.unwrap();
        let again = store.finish_upload(id, UploadStatus::Failed, None).await.unwrap();
        assert!(again.is_none());
        let batch = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.completed_files, 1);
        let rec = store.get_upload(id).await.unwrap().unwrap();
        assert_eq!(rec.status, UploadStatus::Completed);
        assert_eq!(rec.progress, 100);
    }

    #[tokio::test]
    async fn progress_never_decreases_or_hits_100_early() {
        let store = Store::open_in_memory().unwrap();
        let r = record(None, "a.txt");
        let id = r.id;
        store.insert_upload(r).await.unwrap();
        store.mark_upload_processing(id).await.unwrap();
        store.update_upload_progress(id, 50).await.unwrap();
        store.update_upload_progress(id, 30).await.unwrap();
        assert_eq!(store.get_upload(id).await.unwrap().unwrap().progress, 50);
        store.update_upload_progress(id, 100).await.unwrap();
        assert_eq!(store.get_upload(id).await.unwrap().unwrap().progress, 99);
    }

    #[tokio::test]
    async fn deleting_batch_detaches_files() {
        let store = Store::open_in_memory().unwrap();
        let batch = store.create_batch(1).await.unwrap();
        let r = record(Some(batch.id), "a.txt");
        let id = r.id;
        store.insert_upload(r).await.unwrap();
        assert!(store.delete_batch(batch.id).await.unwrap());
        let rec = store.get_upload(id).await.unwrap().unwrap();
        assert_eq!(rec.batch_id, None);
    }

    #[tokio::test]
    async fn zero_file_batch_is_invalid() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(store.create_batch(0).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn metadata_merges() {
        let store = Store::open_in_memory().unwrap();
        let r = record(None, "a.txt");
        let id = r.id;
        store.insert_upload(r).await.unwrap();
        let mut m = Meta::new();
        m.insert("document_id".into(), serde_json::json!("x"));
        store.merge_upload_metadata(id, m).await.unwrap();
        let mut m = Meta::new();
        m.insert("chunks".into(), serde_json::json!(2));
        store.merge_upload_metadata(id, m).await.unwrap();
        let meta = store.get_upload(id).await.unwrap().unwrap().metadata.unwrap();
        assert_eq!(meta.len(), 2);
    }
}
