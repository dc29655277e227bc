use rusqlite::{params, Connection, Row, TransactionBehavior};
use tracing::debug;

use crate::chat_db::schema::{MessageRole, StoredMessage, ToolExchange};
use crate::chat_db::{get_conn, now_string, parse_datetime_or_now, DbPool};

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, tool_call_id, tool_name, \
     tool_input, tool_output, sequence, model_id, created_at";

/// Sequence numbers are assigned inside an immediate transaction; the
/// `UNIQUE(session_id, sequence)` constraint backs that up.
pub struct MessageStore {
    pool: DbPool,
}

struct NewMessage<'a> {
    role: MessageRole,
    content: Option<&'a str>,
    tool_call_id: Option<&'a str>,
    tool_name: Option<&'a str>,
    tool_input: Option<&'a str>,
    tool_output: Option<&'a str>,
    model_id: Option<&'a str>,
}

impl<'a> NewMessage<'a> {
    fn text(role: MessageRole, content: &'a str, model_id: Option<&'a str>) -> Self {
        Self {
            role,
            content: Some(content),
            tool_call_id: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            model_id,
        }
    }
}

impl MessageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn next_sequence(&self, session_id: i64) -> anyhow::Result<i64> {
        let conn = get_conn(&self.pool)?;
        Ok(next_sequence_with_conn(&conn, session_id)?)
    }

    /// `content` is the JSON-encoded list of user content parts.
    pub fn append_user_message(&self, session_id: i64, content: &str) -> anyhow::Result<StoredMessage> {
        let mut stored = self.append_in_tx(session_id, &[NewMessage::text(MessageRole::User, content, None)])?;
        stored.pop().ok_or_else(|| anyhow::anyhow!("User message was not stored"))
    }

    /// `content` is the `assistant_final` JSON envelope.
    pub fn append_assistant_final(
        &self,
        session_id: i64,
        content: &str,
        model_id: Option<&str>,
    ) -> anyhow::Result<StoredMessage> {
        let mut stored = self.append_in_tx(
            session_id,
            &[NewMessage::text(MessageRole::Assistant, content, model_id)],
        )?;
        stored.pop().ok_or_else(|| anyhow::anyhow!("Assistant message was not stored"))
    }

    /// Stores the assistant tool call at `seq` and its result at `seq + 1`.
    pub fn append_tool_exchange(
        &self,
        session_id: i64,
        exchange: &ToolExchange<'_>,
    ) -> anyhow::Result<(StoredMessage, StoredMessage)> {
        let call = NewMessage {
            role: MessageRole::Assistant,
            content: exchange.assistant_content,
            tool_call_id: Some(exchange.tool_call_id),
            tool_name: Some(exchange.tool_name),
            tool_input: Some(exchange.tool_input),
            tool_output: None,
            model_id: exchange.model_id,
        };
        let result = NewMessage {
            role: MessageRole::Tool,
            content: None,
            tool_call_id: Some(exchange.tool_call_id),
            tool_name: Some(exchange.tool_name),
            tool_input: None,
            tool_output: Some(exchange.tool_output),
            model_id: exchange.model_id,
        };

        let mut stored = self.append_in_tx(session_id, &[call, result])?.into_iter();
        match (stored.next(), stored.next()) {
            (Some(call), Some(result)) => Ok((call, result)),
            _ => Err(anyhow::anyhow!("Tool exchange was not stored")),
        }
    }

    pub fn list_messages(&self, session_id: i64) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY sequence ASC",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([session_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn append_in_tx(&self, session_id: i64, messages: &[NewMessage<'_>]) -> anyhow::Result<Vec<StoredMessage>> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now = now_string();
        let mut sequence = next_sequence_with_conn(&tx, session_id)?;
        let mut stored = Vec::with_capacity(messages.len());

        for message in messages {
            tx.execute(
                "INSERT INTO messages
                 (session_id, role, content, tool_call_id, tool_name, tool_input, tool_output,
                  sequence, model_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session_id,
                    message.role.as_str(),
                    message.content,
                    message.tool_call_id,
                    message.tool_name,
                    message.tool_input,
                    message.tool_output,
                    sequence,
                    message.model_id,
                    now,
                ],
            )?;
            stored.push(StoredMessage {
                id: tx.last_insert_rowid(),
                session_id,
                role: message.role,
                content: message.content.map(str::to_string),
                tool_call_id: message.tool_call_id.map(str::to_string),
                tool_name: message.tool_name.map(str::to_string),
                tool_input: message.tool_input.map(str::to_string),
                tool_output: message.tool_output.map(str::to_string),
                sequence,
                model_id: message.model_id.map(str::to_string),
                created_at: parse_datetime_or_now(&now, "created_at"),
            });
            sequence += 1;
        }

        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![now, session_id],
        )?;
        tx.commit()?;

        debug!(session_id, count = stored.len(), "Appended messages");
        Ok(stored)
    }
}

fn next_sequence_with_conn(conn: &Connection, session_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )
}

fn row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(2)?;
    let role = role.parse::<MessageRole>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role,
        content: row.get(3)?,
        tool_call_id: row.get(4)?,
        tool_name: row.get(5)?,
        tool_input: row.get(6)?,
        tool_output: row.get(7)?,
        sequence: row.get(8)?,
        model_id: row.get(9)?,
        created_at: parse_datetime_or_now(&row.get::<_, String>(10)?, "created_at"),
    })
}
