// Library entrypoint for the relay core and the offline store utilities.
pub mod channels;
pub mod config;
pub mod history;
pub mod llm;
pub mod relay;
pub mod storage;

pub use channels::{
    ChannelApi, ChannelError, Clock, MessageRef, StreamRelay, ThreadId, TokioClock,
};
pub use relay::{InboundMessage, RelayHub, TurnOptions, TurnOutcome};
