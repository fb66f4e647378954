//! Conversation and streaming-message state engine.
//!
//! Owns all client-side chat state: the conversation list, the selected
//! conversation's timeline and the single in-flight streaming draft. The
//! view layer renders [`EngineState`] snapshots and reacts to
//! [`EngineEvent`]s; the network side is abstracted behind
//! [`ChatTransport`].

mod conversations;
mod engine;
mod error;
mod session;
mod state;
mod timeline;
mod transport;

pub use conversations::ConversationStore;
pub use engine::ChatEngine;
pub use error::{EngineError, EngineResult};
pub use session::{StreamSessionId, StreamTarget, StreamingSession};
pub use state::{EngineEvent, EngineState};
pub use timeline::MessageTimeline;
pub use transport::{
    BoxFuture, ChatTransport, StreamEvents, StreamHandle, StreamSignal, StreamWorker,
    stream_channel,
};
