use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use parley::config::RelayConfig;
use parley::llm::{ChatMessage, FragmentProducer, FragmentStream};
use parley::relay::{InboundMessage, RelayHub, TurnOptions};
use parley::storage::SqliteStore;
use parley::{ChannelApi, ChannelError, MessageRef, ThreadId};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct ScriptedProducer {
    scripts: Mutex<Vec<Vec<anyhow::Result<String>>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProducer {
    fn with_script(fragments: Vec<anyhow::Result<String>>) -> Self {
        let producer = Self::default();
        producer.scripts.lock().push(fragments);
        producer
    }

    fn push_script(&self, fragments: Vec<anyhow::Result<String>>) {
        self.scripts.lock().push(fragments);
    }

    fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().clone()
    }
}

impl FragmentProducer for ScriptedProducer {
    fn chat_stream(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        self.requests.lock().push(messages);
        let script = {
            let mut scripts = self.scripts.lock();
            if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            }
        };
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        for item in script {
            let _ = tx.send(item);
        }
        drop(tx);
        UnboundedReceiverStream::new(rx)
    }
}

#[derive(Default)]
struct MockChannel {
    opened: Mutex<Vec<String>>,
    posts: Mutex<Vec<(i64, String)>>,
    edits: Mutex<Vec<String>>,
}

#[async_trait]
impl ChannelApi for MockChannel {
    async fn open_thread(&self, title: &str) -> Result<ThreadId, ChannelError> {
        let mut opened = self.opened.lock();
        opened.push(title.to_string());
        Ok(ThreadId(500 + opened.len() as i64 - 1))
    }

    async fn post(&self, thread: ThreadId, text: &str) -> Result<MessageRef, ChannelError> {
        let mut posts = self.posts.lock();
        posts.push((thread.0, text.to_string()));
        Ok(MessageRef {
            thread,
            message_id: posts.len() as i64,
        })
    }

    async fn edit(&self, _message: &MessageRef, text: &str) -> Result<(), ChannelError> {
        self.edits.lock().push(text.to_string());
        Ok(())
    }
}

fn test_settings() -> RelayConfig {
    RelayConfig {
        batch_size: 3,
        min_update_interval_s: 0.0,
        ..RelayConfig::default()
    }
}

fn hub(dir: &TempDir, producer: Arc<ScriptedProducer>) -> RelayHub {
    let store = Arc::new(SqliteStore::open(dir.path().join("parley.db")).unwrap());
    RelayHub::new(store, producer, test_settings()).unwrap()
}

fn inbound(user_id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        user_id,
        user_name: "Alice".to_string(),
        text: text.to_string(),
        date: "2025-06-01 12:00:00".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_contact_creates_room_and_logs_both_sides() {
    let dir = TempDir::new().unwrap();
    let producer = Arc::new(ScriptedProducer::with_script(vec![
        Ok("Hel".to_string()),
        Ok("lo!".to_string()),
    ]));
    let hub = hub(&dir, producer.clone());
    let channel = MockChannel::default();

    let outcome = hub
        .handle_inbound(&channel, inbound(42, "Hi"), TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.assistant_text.as_deref(), Some("Hello!"));
    assert_eq!(outcome.room.admin_thread_id, 500);
    assert_eq!(
        hub.rooms().by_user(42).unwrap().unwrap().admin_thread_id,
        500
    );

    // chat log holds exactly the two sides of the turn, newest first
    let log = hub.chats().last_n(42, 10).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].sender, "assistant");
    assert_eq!(log[0].message.as_deref(), Some("Hello!"));
    assert_eq!(log[1].sender, "user");
    assert_eq!(log[1].message.as_deref(), Some("Hi"));

    assert_eq!(*channel.opened.lock(), vec!["Alice".to_string()]);
    let posts = channel.posts.lock().clone();
    assert!(posts.contains(&(500, "Hi".to_string())));
    assert!(posts.contains(&(42, "...".to_string())));
    assert!(posts.contains(&(500, "Hello!".to_string())));
    assert_eq!(channel.edits.lock().last().map(String::as_str), Some("Hello!"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn returning_user_reuses_the_room_and_sees_history() {
    let dir = TempDir::new().unwrap();
    let producer = Arc::new(ScriptedProducer::with_script(vec![Ok("first".to_string())]));
    producer.push_script(vec![Ok("second".to_string())]);
    let hub = hub(&dir, producer.clone());
    let channel = MockChannel::default();

    hub.handle_inbound(&channel, inbound(42, "hello"), TurnOptions::default())
        .await
        .unwrap();
    hub.handle_inbound(&channel, inbound(42, "again"), TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(channel.opened.lock().len(), 1);

    let requests = producer.requests();
    assert_eq!(requests.len(), 2);
    // system + hello + first + again
    assert_eq!(requests[1].len(), 4);
    assert_eq!(requests[1][0].role, "system");
    assert_eq!(requests[1][1].content, "hello");
    assert_eq!(requests[1][2].content, "first");
    assert_eq!(requests[1][3].content, "again");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_assistant_logs_only_the_user_side() {
    let dir = TempDir::new().unwrap();
    let producer = Arc::new(ScriptedProducer::default());
    let hub = hub(&dir, producer.clone());
    let channel = MockChannel::default();

    let outcome = hub
        .handle_inbound(
            &channel,
            inbound(42, "anyone there?"),
            TurnOptions {
                assistant_enabled: false,
            },
        )
        .await
        .unwrap();

    assert!(outcome.assistant_text.is_none());
    assert!(producer.requests().is_empty());
    assert_eq!(hub.chats().last_n(42, 10).unwrap().len(), 1);
    // only the admin copy went out; the user got no placeholder message
    assert!(channel.posts.lock().iter().all(|(thread, _)| *thread == 500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persisted_system_prompt_reaches_the_model() {
    let dir = TempDir::new().unwrap();
    let producer = Arc::new(ScriptedProducer::with_script(vec![Ok("ok".to_string())]));
    let hub = hub(&dir, producer.clone());
    let channel = MockChannel::default();

    hub.update_system_prompt("Answer in haiku only.").await.unwrap();
    hub.handle_inbound(&channel, inbound(42, "hi"), TurnOptions::default())
        .await
        .unwrap();

    let requests = producer.requests();
    assert_eq!(requests[0][0].role, "system");
    assert_eq!(requests[0][0].content, "Answer in haiku only.");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn producer_failure_still_delivers_and_logs_partial_text() {
    let dir = TempDir::new().unwrap();
    let producer = Arc::new(ScriptedProducer::with_script(vec![
        Ok("par".to_string()),
        Err(anyhow!("backend disappeared")),
    ]));
    let hub = hub(&dir, producer.clone());
    let channel = MockChannel::default();

    let outcome = hub
        .handle_inbound(&channel, inbound(42, "hi"), TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.assistant_text.as_deref(), Some("par"));
    let log = hub.chats().last_n(42, 10).unwrap();
    assert_eq!(log[0].sender, "assistant");
    assert_eq!(log[0].message.as_deref(), Some("par"));
    assert_eq!(channel.edits.lock().last().map(String::as_str), Some("par"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_model_output_is_logged_and_noted_to_admin() {
    let dir = TempDir::new().unwrap();
    let producer = Arc::new(ScriptedProducer::with_script(Vec::new()));
    let hub = hub(&dir, producer.clone());
    let channel = MockChannel::default();

    let outcome = hub
        .handle_inbound(&channel, inbound(42, "hi"), TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.assistant_text.as_deref(), Some(""));
    let log = hub.chats().last_n(42, 10).unwrap();
    assert_eq!(log[0].message.as_deref(), Some(""));
    assert!(channel
        .posts
        .lock()
        .contains(&(500, "Assistant message empty".to_string())));
}
