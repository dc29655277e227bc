use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::chat_db::schema::{FileImage, FileRecord, NewFileImage, ProcessingStatus};
use crate::chat_db::{get_conn, now_string, parse_datetime_or_now, DbPool};

const FILE_COLUMNS: &str = "id, user_id, filename, file_type, mime_type, file_size, \
     processing_status, error_message, created_at";

const IMAGE_COLUMNS: &str = "id, file_id, page_number, image_data, width, height, file_size, \
     mime_type, created_at";

/// Uploaded files and their rendered pages.
///
/// Status changes are compare-and-set updates; a transition from the wrong
/// state matches no rows and returns `false` without touching the record.
pub struct FileStore {
    pool: DbPool,
}

impl FileStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create_file(
        &self,
        user_id: i64,
        filename: &str,
        file_type: &str,
        mime_type: &str,
        data: &[u8],
    ) -> anyhow::Result<i64> {
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "INSERT INTO files
             (user_id, filename, file_type, mime_type, file_data, file_size, processing_status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![user_id, filename, file_type, mime_type, data, data.len() as i64, now_string()],
        )?;
        let id = conn.last_insert_rowid();
        info!(file_id = id, user_id, filename, file_type, "Stored upload");
        Ok(id)
    }

    pub fn get_file(&self, user_id: i64, file_id: i64) -> anyhow::Result<Option<FileRecord>> {
        let conn = get_conn(&self.pool)?;
        let file = conn
            .query_row(
                &format!("SELECT {} FROM files WHERE id = ?1 AND user_id = ?2", FILE_COLUMNS),
                params![file_id, user_id],
                row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    /// Original upload bytes, owner-scoped.
    pub fn get_file_data(&self, user_id: i64, file_id: i64) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = get_conn(&self.pool)?;
        let data = conn
            .query_row(
                "SELECT file_data FROM files WHERE id = ?1 AND user_id = ?2",
                params![file_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    pub fn list_files(&self, user_id: i64) -> anyhow::Result<Vec<FileRecord>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM files WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
            FILE_COLUMNS
        ))?;
        let files = stmt
            .query_map([user_id], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    pub fn delete_file(&self, user_id: i64, file_id: i64) -> anyhow::Result<bool> {
        let conn = get_conn(&self.pool)?;
        let deleted = conn.execute(
            "DELETE FROM files WHERE id = ?1 AND user_id = ?2",
            params![file_id, user_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn get_status(&self, file_id: i64) -> anyhow::Result<Option<ProcessingStatus>> {
        let conn = get_conn(&self.pool)?;
        let status: Option<String> = conn
            .query_row(
                "SELECT processing_status FROM files WHERE id = ?1",
                [file_id],
                |row| row.get(0),
            )
            .optional()?;
        status.map(|s| s.parse::<ProcessingStatus>()).transpose()
    }

    /// `pending -> processing`.
    pub fn mark_processing(&self, file_id: i64) -> anyhow::Result<bool> {
        let conn = get_conn(&self.pool)?;
        let updated = conn.execute(
            "UPDATE files SET processing_status = 'processing'
             WHERE id = ?1 AND processing_status IN ('pending')",
            [file_id],
        )?;
        log_transition(file_id, ProcessingStatus::Processing, updated);
        Ok(updated > 0)
    }

    /// `processing -> completed`, inserting the pages in the same transaction.
    pub fn complete_with_images(&self, file_id: i64, images: &[NewFileImage]) -> anyhow::Result<bool> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE files SET processing_status = 'completed', error_message = NULL
             WHERE id = ?1 AND processing_status IN ('processing')",
            [file_id],
        )?;
        log_transition(file_id, ProcessingStatus::Completed, updated);
        if updated == 0 {
            tx.rollback()?;
            return Ok(false);
        }

        let now = now_string();
        for image in images {
            tx.execute(
                "INSERT INTO file_images
                 (file_id, page_number, image_data, width, height, file_size, mime_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    file_id,
                    image.page_number,
                    image.image_data,
                    image.width,
                    image.height,
                    image.image_data.len() as i64,
                    image.mime_type,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// `pending | processing -> failed`.
    pub fn mark_failed(&self, file_id: i64, error_message: &str) -> anyhow::Result<bool> {
        let conn = get_conn(&self.pool)?;
        let updated = conn.execute(
            "UPDATE files SET processing_status = 'failed', error_message = ?2
             WHERE id = ?1 AND processing_status IN ('pending', 'processing')",
            params![file_id, error_message],
        )?;
        log_transition(file_id, ProcessingStatus::Failed, updated);
        Ok(updated > 0)
    }

    pub fn list_images(&self, file_id: i64) -> anyhow::Result<Vec<FileImage>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_images WHERE file_id = ?1 ORDER BY page_number ASC",
            IMAGE_COLUMNS
        ))?;
        let images = stmt
            .query_map([file_id], row_to_image)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    pub fn get_image(&self, file_id: i64, page_number: i64) -> anyhow::Result<Option<FileImage>> {
        let conn = get_conn(&self.pool)?;
        let image = conn
            .query_row(
                &format!(
                    "SELECT {} FROM file_images WHERE file_id = ?1 AND page_number = ?2",
                    IMAGE_COLUMNS
                ),
                params![file_id, page_number],
                row_to_image,
            )
            .optional()?;
        Ok(image)
    }

    pub fn count_images(&self, file_id: i64) -> anyhow::Result<i64> {
        let conn = get_conn(&self.pool)?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM file_images WHERE file_id = ?1",
            [file_id],
            |row| row.get(0),
        )?)
    }
}

fn log_transition(file_id: i64, to: ProcessingStatus, updated: usize) {
    if updated == 0 {
        warn!(file_id, to = %to, "Rejected file status transition");
    } else {
        debug!(file_id, to = %to, "File status transition");
    }
}

fn row_to_file(row: &Row) -> rusqlite::Result<FileRecord> {
    let status: String = row.get(6)?;
    let processing_status = status.parse::<ProcessingStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(FileRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        filename: row.get(2)?,
        file_type: row.get(3)?,
        mime_type: row.get(4)?,
        file_size: row.get(5)?,
        processing_status,
        error_message: row.get(7)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(8)?, "created_at"),
    })
}

fn row_to_image(row: &Row) -> rusqlite::Result<FileImage> {
    Ok(FileImage {
        id: row.get(0)?,
        file_id: row.get(1)?,
        page_number: row.get(2)?,
        image_data: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        file_size: row.get(6)?,
        mime_type: row.get(7)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(8)?, "created_at"),
    })
}
