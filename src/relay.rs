// 会话回合编排:入站消息 → 房间/日志 → 历史 → 模型流 → 合批投递。
use crate::channels::{ChannelApi, StreamRelay, ThreadId};
use crate::config::RelayConfig;
use crate::history::{build_history, SENDER_ASSISTANT, SENDER_USER};
use crate::llm::{ChatMessage, FragmentProducer};
use crate::storage::{ConfigTable, RoomChatsTable, RoomInfoTable, RoomRecord, SqliteStore};
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tracing::warn;

const EMPTY_ASSISTANT_NOTE: &str = "Assistant message empty";

/// One inbound user message, already stripped of transport details. The
/// timestamp is caller-supplied and treated as opaque text.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub user_id: i64,
    pub user_name: String,
    pub text: String,
    pub date: String,
}

/// Request-scoped switches for one turn. The original kept these as
/// process-wide globals; carrying them per call keeps concurrent turns
/// independent.
#[derive(Debug, Clone, Copy)]
pub struct TurnOptions {
    pub assistant_enabled: bool,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            assistant_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub room: RoomRecord,
    /// `None` when the assistant was disabled for the turn or the inbound
    /// text was empty; otherwise exactly the text delivered to the channel.
    pub assistant_text: Option<String>,
}

/// Wires one conversation turn end to end. The channel transport stays
/// behind [`ChannelApi`]; storage work runs on the blocking pool since the
/// store API is synchronous.
pub struct RelayHub {
    rooms: Arc<RoomInfoTable>,
    chats: Arc<RoomChatsTable>,
    config_blob: Arc<ConfigTable>,
    producer: Arc<dyn FragmentProducer>,
    relay: StreamRelay,
    settings: RelayConfig,
}

impl RelayHub {
    pub fn new(
        store: Arc<SqliteStore>,
        producer: Arc<dyn FragmentProducer>,
        settings: RelayConfig,
    ) -> Result<Self> {
        let rooms = Arc::new(RoomInfoTable::open_default(store.clone())?);
        let chats = Arc::new(RoomChatsTable::open_default(store.clone())?);
        let config_blob = Arc::new(ConfigTable::open_default(store)?);
        let relay = StreamRelay::new(
            settings.batch_size,
            Duration::from_secs_f64(settings.min_update_interval_s.max(0.0)),
        )
        .with_preamble(settings.preamble.clone());
        Ok(Self {
            rooms,
            chats,
            config_blob,
            producer,
            relay,
            settings,
        })
    }

    pub fn rooms(&self) -> &RoomInfoTable {
        &self.rooms
    }

    pub fn chats(&self) -> &RoomChatsTable {
        &self.chats
    }

    pub fn config_blob(&self) -> &ConfigTable {
        &self.config_blob
    }

    pub async fn handle_inbound(
        &self,
        channel: &dyn ChannelApi,
        msg: InboundMessage,
        opts: TurnOptions,
    ) -> Result<TurnOutcome> {
        let room = self.ensure_room(channel, &msg).await?;

        {
            let chats = self.chats.clone();
            let (user_id, text, date) = (msg.user_id, msg.text.clone(), msg.date.clone());
            spawn_blocking(move || chats.insert(user_id, SENDER_USER, &text, &date))
                .await
                .context("chat insert task")??;
        }
        // 用户消息同步到管理员线程,失败不阻断回合。
        if let Err(err) = channel.post(ThreadId(room.admin_thread_id), &msg.text).await {
            warn!("relaying inbound text to admin thread failed: {err}");
        }

        if !opts.assistant_enabled || msg.text.trim().is_empty() {
            return Ok(TurnOutcome {
                room,
                assistant_text: None,
            });
        }

        let messages = self.build_messages(msg.user_id).await?;
        let stream = self.producer.chat_stream(messages);
        let assistant_text = self
            .relay
            .deliver(
                stream,
                channel,
                ThreadId(msg.user_id),
                &self.settings.placeholder,
            )
            .await?;

        {
            let chats = self.chats.clone();
            let (user_id, text, date) = (msg.user_id, assistant_text.clone(), msg.date.clone());
            spawn_blocking(move || chats.insert(user_id, SENDER_ASSISTANT, &text, &date))
                .await
                .context("chat insert task")??;
        }
        let copy = if assistant_text.is_empty() {
            EMPTY_ASSISTANT_NOTE.to_string()
        } else {
            assistant_text.clone()
        };
        if let Err(err) = channel.post(ThreadId(room.admin_thread_id), &copy).await {
            warn!("posting assistant copy to admin thread failed: {err}");
        }

        Ok(TurnOutcome {
            room,
            assistant_text: Some(assistant_text),
        })
    }

    /// Replaces the persisted system prompt in the config blob (wholesale
    /// read-modify-write, the blob has no partial update).
    pub async fn update_system_prompt(&self, prompt: &str) -> Result<()> {
        let config_blob = self.config_blob.clone();
        let prompt = prompt.to_string();
        spawn_blocking(move || {
            let mut blob = config_blob.load()?;
            blob.insert("system_prompt".to_string(), Value::String(prompt));
            config_blob.save(&blob)
        })
        .await
        .context("config save task")??;
        Ok(())
    }

    async fn ensure_room(
        &self,
        channel: &dyn ChannelApi,
        msg: &InboundMessage,
    ) -> Result<RoomRecord> {
        let existing = {
            let rooms = self.rooms.clone();
            let user_id = msg.user_id;
            spawn_blocking(move || rooms.by_user(user_id))
                .await
                .context("room lookup task")??
        };
        if let Some(room) = existing {
            return Ok(room);
        }
        let thread = channel
            .open_thread(&msg.user_name)
            .await
            .map_err(|err| anyhow!("admin thread creation failed: {err}"))?;
        let record = RoomRecord {
            user_id: msg.user_id,
            admin_thread_id: thread.0,
        };
        {
            let rooms = self.rooms.clone();
            let room = record.clone();
            spawn_blocking(move || rooms.insert(room.user_id, room.admin_thread_id))
                .await
                .context("room insert task")??;
        }
        Ok(record)
    }

    async fn build_messages(&self, user_id: i64) -> Result<Vec<ChatMessage>> {
        let window = self.settings.history_window.max(1);
        let rows = {
            let chats = self.chats.clone();
            spawn_blocking(move || chats.last_n(user_id, window))
                .await
                .context("history read task")??
        };
        let mut messages = build_history(&rows)?;
        let system_prompt = self.system_prompt().await?;
        messages.insert(
            0,
            ChatMessage {
                role: "system".to_string(),
                content: system_prompt,
            },
        );
        Ok(messages)
    }

    async fn system_prompt(&self) -> Result<String> {
        let blob = {
            let config_blob = self.config_blob.clone();
            spawn_blocking(move || config_blob.load())
                .await
                .context("config load task")??
        };
        let prompt = blob
            .get("system_prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.system_prompt.clone());
        Ok(prompt)
    }
}
