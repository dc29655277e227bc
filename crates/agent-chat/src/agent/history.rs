//! Conversion between stored messages and model messages.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chat_db::{ChatDatabase, FileRecord, MessageRole, ProcessingStatus, StoredMessage};
use crate::llm::{ChatMessage, ContentPart, ImageUrl, MessageContent, ToolCall};

/// Stored form of a final assistant answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantFinal {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "final")]
    pub final_text: String,
    #[serde(default)]
    pub progress: Vec<String>,
}

impl AssistantFinal {
    pub fn new(final_text: impl Into<String>, progress: Vec<String>) -> Self {
        Self {
            kind: "assistant_final".to_string(),
            final_text: final_text.into(),
            progress,
        }
    }

    /// Returns the envelope if `raw` is one.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str::<Self>(raw)
            .ok()
            .filter(|envelope| envelope.kind == "assistant_final")
    }
}

/// Replays stored messages as model input. Image parts are replaced by a
/// note when the model cannot see images.
pub fn to_chat_messages(stored: &[StoredMessage], supports_vision: bool) -> Vec<ChatMessage> {
    let mut history = Vec::with_capacity(stored.len());
    for message in stored {
        match message.role {
            MessageRole::User => {
                let Some(raw) = message.content.as_deref() else {
                    continue;
                };
                let content = serde_json::from_str::<MessageContent>(raw)
                    .unwrap_or_else(|_| MessageContent::Text(raw.to_string()));
                let content = if supports_vision { content } else { strip_images(content) };
                history.push(ChatMessage::User { content });
            }
            MessageRole::Assistant => match (&message.tool_call_id, &message.tool_name) {
                (Some(call_id), Some(name)) => history.push(ChatMessage::Assistant {
                    content: message.content.clone().filter(|c| !c.trim().is_empty()),
                    tool_calls: vec![ToolCall::function(
                        call_id.clone(),
                        name.clone(),
                        message.tool_input.clone().unwrap_or_else(|| "{}".to_string()),
                    )],
                }),
                _ => {
                    let raw = message.content.as_deref().unwrap_or_default();
                    let text = AssistantFinal::parse(raw)
                        .map(|envelope| envelope.final_text)
                        .unwrap_or_else(|| raw.to_string());
                    history.push(ChatMessage::assistant_text(text));
                }
            },
            MessageRole::Tool => {
                let Some(call_id) = message.tool_call_id.clone() else {
                    warn!(message_id = message.id, "Skipping tool message without tool_call_id");
                    continue;
                };
                history.push(ChatMessage::Tool {
                    tool_call_id: call_id,
                    content: message.tool_output.clone().unwrap_or_default(),
                });
            }
        }
    }
    history
}

fn strip_images(content: MessageContent) -> MessageContent {
    match content {
        MessageContent::Text(text) => MessageContent::Text(text),
        MessageContent::Parts(parts) => {
            let mut dropped = 0usize;
            let mut kept: Vec<ContentPart> = parts
                .into_iter()
                .filter(|part| match part {
                    ContentPart::ImageUrl { .. } => {
                        dropped += 1;
                        false
                    }
                    ContentPart::Text { .. } => true,
                })
                .collect();
            if dropped > 0 {
                kept.push(ContentPart::Text {
                    text: format!("[{} image(s) omitted: the selected model cannot view images]", dropped),
                });
            }
            MessageContent::Parts(kept)
        }
    }
}

/// Builds the current user turn: the text, then the pages of each
/// referenced file the user owns whose conversion has completed.
pub fn build_user_content(
    database: &ChatDatabase,
    user_id: i64,
    text: &str,
    file_ids: &[i64],
    supports_vision: bool,
) -> anyhow::Result<Vec<ContentPart>> {
    let mut parts = vec![ContentPart::Text { text: text.to_string() }];

    for &file_id in file_ids {
        let Some(file) = database.files.get_file(user_id, file_id)? else {
            warn!(file_id, user_id, "Referenced file not found for user");
            continue;
        };
        if file.processing_status != ProcessingStatus::Completed {
            warn!(file_id, status = %file.processing_status, "Referenced file is not ready");
            continue;
        }

        let images = database.files.list_images(file_id)?;
        if supports_vision {
            for image in &images {
                parts.push(ContentPart::Text {
                    text: format!("\n[File: {}, Page {}]", file.filename, image.page_number),
                });
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", image.mime_type, STANDARD.encode(&image.image_data)),
                        detail: Some("high".to_string()),
                    },
                });
            }
        } else {
            parts.push(ContentPart::Text {
                text: text_only_note(&file, images.len()),
            });
        }
    }
    Ok(parts)
}

fn text_only_note(file: &FileRecord, pages: usize) -> String {
    format!(
        "\n[File: {} ({} page(s)) attached; the selected model cannot view images]",
        file.filename, pages
    )
}
