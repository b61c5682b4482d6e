use async_trait::async_trait;
use std::time::Duration;

/// Opaque chat/thread identity on the external channel. For direct chats
/// the transport uses the peer's own id as the thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub i64);

/// Handle to one posted message, as returned by [`ChannelApi::post`];
/// required for later edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub thread: ThreadId,
    pub message_id: i64,
}

#[derive(Debug)]
pub enum ChannelError {
    /// The channel refused the call and dictated the wait before retrying.
    RateLimited(Duration),
    Other(anyhow::Error),
}

impl ChannelError {
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        Self::Other(err.into())
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited(wait) => write!(
                f,
                "channel rate limited, retry after {:.1}s",
                wait.as_secs_f64()
            ),
            Self::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Other(err) => Some(&**err),
            Self::RateLimited(_) => None,
        }
    }
}

/// The shape the core expects from the external messaging channel. The
/// transport/protocol implementation lives outside this crate; adapters
/// implement this trait (tests use in-memory mocks).
#[async_trait]
pub trait ChannelApi: Send + Sync {
    /// Opens a fresh admin-side discussion thread and returns its id.
    async fn open_thread(&self, title: &str) -> Result<ThreadId, ChannelError>;

    /// Posts a new message and returns the handle needed for edits.
    async fn post(&self, thread: ThreadId, text: &str) -> Result<MessageRef, ChannelError>;

    /// Replaces the full text of an existing message.
    async fn edit(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError>;
}
