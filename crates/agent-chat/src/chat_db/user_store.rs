use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use tracing::info;

use crate::chat_db::schema::User;
use crate::chat_db::{get_conn, now_string, parse_datetime_or_now, DbPool};

const USER_COLUMNS: &str = "id, username, hashed_password, created_at, updated_at";

pub struct UserStore {
    pool: DbPool,
}

impl UserStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Returns `None` when the username is already taken.
    pub fn create_user(&self, username: &str, hashed_password: &str) -> anyhow::Result<Option<User>> {
        let conn = get_conn(&self.pool)?;
        let now = now_string();

        let inserted = conn.execute(
            "INSERT INTO users (username, hashed_password, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![username, hashed_password, now],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let id = conn.last_insert_rowid();
        info!(user_id = id, username, "Created user");
        Ok(Some(User {
            id,
            username: username.to_string(),
            hashed_password: hashed_password.to_string(),
            created_at: parse_datetime_or_now(&now, "created_at"),
            updated_at: parse_datetime_or_now(&now, "updated_at"),
        }))
    }

    pub fn get_by_username(&self, username: &str) -> anyhow::Result<Option<User>> {
        let conn = get_conn(&self.pool)?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                [username],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_by_id(&self, id: i64) -> anyhow::Result<Option<User>> {
        let conn = get_conn(&self.pool)?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                [id],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        hashed_password: row.get(2)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(3)?, "created_at"),
        updated_at: parse_datetime_or_now(&row.get::<_, String>(4)?, "updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use crate::chat_db::ChatDatabase;

    #[test]
    fn test_create_and_fetch_user() {
        let db = ChatDatabase::new_in_memory().unwrap();
        let user = db.users.create_user("alice", "hash").unwrap().unwrap();

        let by_name = db.users.get_by_username("alice").unwrap().unwrap();
        assert_eq!(by_name.id, user.id);
        assert_eq!(by_name.hashed_password, "hash");

        let by_id = db.users.get_by_id(user.id).unwrap().unwrap();
        assert_eq!(by_id.username, "alice");
    }

    #[test]
    fn test_duplicate_username_is_reported() {
        let db = ChatDatabase::new_in_memory().unwrap();
        assert!(db.users.create_user("bob", "h1").unwrap().is_some());
        assert!(db.users.create_user("bob", "h2").unwrap().is_none());

        let stored = db.users.get_by_username("bob").unwrap().unwrap();
        assert_eq!(stored.hashed_password, "h1");
    }

    #[test]
    fn test_missing_user() {
        let db = ChatDatabase::new_in_memory().unwrap();
        assert!(db.users.get_by_username("nobody").unwrap().is_none());
        assert!(db.users.get_by_id(42).unwrap().is_none());
    }
}
