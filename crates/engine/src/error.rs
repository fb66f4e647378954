use mnemo_protocol::{ConversationId, TransportError};
use snafu::Snafu;

pub type EngineResult<T> = Result<T, EngineError>;

/// Tagged failure taxonomy for every engine operation.
///
/// Local/state errors (`Validation`, `InvalidState`, `ConcurrentStream`,
/// `Ordering`, `NotFound`) are synchronous and never reach the transport;
/// `Transport` wraps a failure from the network boundary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("invalid input on `{stage}`: {reason}"))]
    Validation {
        stage: &'static str,
        reason: &'static str,
    },
    #[snafu(display("operation `{operation}` is illegal in the current engine state"))]
    InvalidState {
        stage: &'static str,
        operation: &'static str,
    },
    #[snafu(display(
        "a streaming session is already active for conversation '{conversation_id}'"
    ))]
    ConcurrentStream {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display(
        "message turn {attempted} is not greater than the current maximum {current_max}"
    ))]
    Ordering {
        stage: &'static str,
        attempted: u32,
        current_max: u32,
    },
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    NotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("transport failure on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
}
