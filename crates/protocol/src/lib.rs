pub mod error;
pub mod ids;
pub mod sse;
pub mod types;
pub mod wire;

pub use error::{ProtocolError, ProtocolResult, TransportError, TransportResult};
pub use ids::{ConversationId, MessageId, UserId};
pub use sse::{ServerFrame, SseDecoder};
pub use types::{
    Conversation, DEFAULT_CONVERSATION_TITLE, DraftStatus, Message, Role, StreamingDraft, User,
};
pub use wire::{
    CompletedMessageDto, ConversationDto, CreateConversationRequest, GoogleAuthRequest,
    LoginRequest, MessageDto, RefreshRequest, RegisterRequest, SendMessageRequest, StreamEvent,
    TokenResponse, UserDto,
};
