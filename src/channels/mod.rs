// 通道模块:对外通道 API 抽象与限速合批投递。

mod stream_relay;
mod types;

pub use stream_relay::{Clock, StreamRelay, TokioClock};
pub use types::{ChannelApi, ChannelError, MessageRef, ThreadId};
