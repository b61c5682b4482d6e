use crate::llm::ChatMessage;
use crate::storage::ChatEventRecord;
use anyhow::{bail, Result};

pub const SENDER_USER: &str = "user";
pub const SENDER_ASSISTANT: &str = "assistant";

/// Turns stored chat events into the message list a model resubmission
/// expects. Input is newest-first (the shape `last_n` returns); output is
/// chronological. Events with an empty or NULL message are dropped; any
/// sender other than `user`/`assistant` is a defect in the log and fails
/// the whole build.
pub fn build_history(rows: &[ChatEventRecord]) -> Result<Vec<ChatMessage>> {
    let mut history = Vec::with_capacity(rows.len());
    for row in rows.iter().rev() {
        let Some(message) = row.message.as_deref() else {
            continue;
        };
        if message.is_empty() {
            continue;
        }
        let role = match row.sender.as_str() {
            SENDER_USER => SENDER_USER,
            SENDER_ASSISTANT => SENDER_ASSISTANT,
            other => bail!("unknown sender {other:?} in chat event {}", row.id),
        };
        history.push(ChatMessage {
            role: role.to_string(),
            content: message.to_string(),
        });
    }
    Ok(history)
}
