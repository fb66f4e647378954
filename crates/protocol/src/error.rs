use snafu::Snafu;

pub type ProtocolResult<T> = Result<T, ProtocolError>;
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures decoding the wire format itself.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtocolError {
    #[snafu(display("stream frame is not valid UTF-8 on `{stage}`: {source}"))]
    NonUtf8Frame {
        stage: &'static str,
        source: std::str::Utf8Error,
    },
    #[snafu(display("failed to decode stream event on `{stage}`: {source}"))]
    EventDecode {
        stage: &'static str,
        source: serde_json::Error,
    },
}

/// Network/auth/server failures as the engine sees them, carrying a
/// human-readable cause. Callers branch on the variant, never on strings.
///
/// Lives here rather than in the transport crate so the engine can consume
/// it without depending on any HTTP implementation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("failed to build http client on `{stage}`: {message}"))]
    ClientBuild { stage: &'static str, message: String },
    #[snafu(display("request failed on `{stage}`: {message}"))]
    Network { stage: &'static str, message: String },
    #[snafu(display("server returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode server payload on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("stream payload violated the wire protocol on `{stage}`: {source}"))]
    Protocol {
        stage: &'static str,
        source: ProtocolError,
    },
    #[snafu(display("assistant stream reported an error: {message}"))]
    Upstream { stage: &'static str, message: String },
    #[snafu(display("stream went silent for more than {limit_seconds}s"))]
    StreamInactive {
        stage: &'static str,
        limit_seconds: u64,
    },
    #[snafu(display("stream channel closed before a terminal event"))]
    ChannelClosed { stage: &'static str },
    #[snafu(display("no access token is set for authenticated call on `{stage}`"))]
    Unauthenticated { stage: &'static str },
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthenticated { .. }) || self.status() == Some(401)
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::StreamInactive { .. } | Self::ChannelClosed { .. }
        )
    }
}
