use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use crate::chat_db::schema::Session;
use crate::chat_db::{get_conn, now_string, parse_datetime_or_now, DbPool};

const SESSION_COLUMNS: &str = "id, user_id, title, model_id, created_at, updated_at";

/// Sessions are owner-scoped: a session owned by someone else reads as missing.
pub struct SessionStore {
    pool: DbPool,
}

impl SessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create_session(
        &self,
        user_id: i64,
        title: Option<&str>,
        model_id: &str,
    ) -> anyhow::Result<Session> {
        let conn = get_conn(&self.pool)?;
        let now = now_string();
        conn.execute(
            "INSERT INTO sessions (user_id, title, model_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user_id, title, model_id, now],
        )?;
        let id = conn.last_insert_rowid();
        info!(session_id = id, user_id, model_id, "Created session");

        Ok(Session {
            id,
            user_id,
            title: title.map(str::to_string),
            model_id: model_id.to_string(),
            created_at: parse_datetime_or_now(&now, "created_at"),
            updated_at: parse_datetime_or_now(&now, "updated_at"),
        })
    }

    pub fn list_sessions(&self, user_id: i64) -> anyhow::Result<Vec<Session>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE user_id = ?1 ORDER BY updated_at DESC, id DESC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([user_id], row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    pub fn get_session(&self, user_id: i64, session_id: i64) -> anyhow::Result<Option<Session>> {
        let conn = get_conn(&self.pool)?;
        let session = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1 AND user_id = ?2", SESSION_COLUMNS),
                params![session_id, user_id],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Applies the provided fields and returns the updated row, or `None` if not owned.
    pub fn update_session(
        &self,
        user_id: i64,
        session_id: i64,
        title: Option<&str>,
        model_id: Option<&str>,
    ) -> anyhow::Result<Option<Session>> {
        {
            let conn = get_conn(&self.pool)?;
            let updated = conn.execute(
                "UPDATE sessions
                 SET title = COALESCE(?1, title),
                     model_id = COALESCE(?2, model_id),
                     updated_at = ?3
                 WHERE id = ?4 AND user_id = ?5",
                params![title, model_id, now_string(), session_id, user_id],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_session(user_id, session_id)
    }

    pub fn touch_session(&self, session_id: i64) -> anyhow::Result<()> {
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![now_string(), session_id],
        )?;
        Ok(())
    }

    /// Deletes the session and, through the foreign key cascade, its messages.
    pub fn delete_session(&self, user_id: i64, session_id: i64) -> anyhow::Result<bool> {
        let conn = get_conn(&self.pool)?;
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE id = ?1 AND user_id = ?2",
            params![session_id, user_id],
        )?;
        debug!(session_id, deleted, "Delete session");
        Ok(deleted > 0)
    }
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        model_id: row.get(3)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(4)?, "created_at"),
        updated_at: parse_datetime_or_now(&row.get::<_, String>(5)?, "updated_at"),
    })
}
