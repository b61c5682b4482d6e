// 流式合批投递:把细粒度片段流压成有限次的消息编辑。
use crate::channels::{ChannelApi, ChannelError, MessageRef, ThreadId};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::time::{Duration, Instant};
use tracing::warn;

/// Hard cap on back-to-back rate-limit retries for one flush. The original
/// behavior retried forever; past the cap the flush degrades to the
/// non-fatal skip path and the stream keeps going.
const RATE_LIMIT_RETRY_MAX: u32 = 25;

/// Time source injected into the coalescer so tests run on simulated time.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bridges a fast fragment producer to a rate-limited channel: one created
/// message per turn, then throttled full-text edits. An edit is due when
/// `batch_size` fragments piled up or `min_interval` elapsed since the last
/// delivered update, whichever comes first; the interval is additionally
/// enforced by sleeping before each edit, so the coalescer does not provoke
/// the rate limit it would then have to honor.
pub struct StreamRelay<C: Clock = TokioClock> {
    batch_size: usize,
    min_interval: Duration,
    preamble: Option<String>,
    clock: C,
}

impl StreamRelay<TokioClock> {
    pub fn new(batch_size: usize, min_interval: Duration) -> Self {
        Self::with_clock(batch_size, min_interval, TokioClock)
    }
}

impl<C: Clock> StreamRelay<C> {
    pub fn with_clock(batch_size: usize, min_interval: Duration, clock: C) -> Self {
        Self {
            batch_size: batch_size.max(1),
            min_interval,
            preamble: None,
            clock,
        }
    }

    /// Banner prefixed to every delivered edit (never part of the returned
    /// text), e.g. a model-output disclaimer.
    pub fn with_preamble(mut self, preamble: Option<String>) -> Self {
        self.preamble = preamble.filter(|text| !text.is_empty());
        self
    }

    /// Consumes the fragment stream and mirrors it onto the channel.
    /// Returns the full accumulated text — under a producer error, the text
    /// accumulated up to the failure (the error itself stops here).
    ///
    /// Only the initial create can fail the call; once the placeholder is
    /// out, every later channel problem is degraded to a logged skip so the
    /// stream is always drained.
    pub async fn deliver<S>(
        &self,
        mut fragments: S,
        channel: &dyn ChannelApi,
        thread: ThreadId,
        placeholder: &str,
    ) -> Result<String>
    where
        S: Stream<Item = Result<String>> + Unpin,
    {
        let message = channel
            .post(thread, placeholder)
            .await
            .map_err(|err| anyhow!("initial message create failed: {err}"))?;
        let mut last_update = self.clock.now();
        let mut text = String::new();
        let mut pending = 0usize;

        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    text.push_str(&fragment);
                    pending += 1;
                    let elapsed = self.clock.now().saturating_duration_since(last_update);
                    if pending >= self.batch_size || elapsed >= self.min_interval {
                        pending = 0;
                        self.flush(channel, &message, &text, &mut last_update).await;
                    }
                }
                Err(err) => {
                    // 生产端失败:尽力投递已累计的部分,错误到此为止。
                    warn!("fragment stream failed, delivering partial text: {err:#}");
                    if !text.is_empty() {
                        self.flush(channel, &message, &text, &mut last_update).await;
                    }
                    return Ok(text);
                }
            }
        }

        if pending > 0 {
            self.flush(channel, &message, &text, &mut last_update).await;
        }
        Ok(text)
    }

    async fn flush(
        &self,
        channel: &dyn ChannelApi,
        message: &MessageRef,
        text: &str,
        last_update: &mut Instant,
    ) {
        let elapsed = self.clock.now().saturating_duration_since(*last_update);
        if elapsed < self.min_interval {
            self.clock.sleep(self.min_interval - elapsed).await;
        }
        let payload = match &self.preamble {
            Some(preamble) => format!("{preamble}\n---\n{text}"),
            None => text.to_string(),
        };
        let mut rate_limited = 0u32;
        loop {
            match channel.edit(message, &payload).await {
                Ok(()) => {
                    *last_update = self.clock.now();
                    return;
                }
                Err(ChannelError::RateLimited(wait)) => {
                    rate_limited += 1;
                    if rate_limited > RATE_LIMIT_RETRY_MAX {
                        warn!(
                            "giving up on flush after {rate_limited} rate-limit responses, \
                             content stays pending for the next edit"
                        );
                        return;
                    }
                    self.clock.sleep(wait).await;
                }
                Err(err) => {
                    warn!("message edit failed, keeping the stream alive: {err}");
                    return;
                }
            }
        }
    }
}
