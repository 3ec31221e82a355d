use crate::turn::Turn;

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The transcript could not be written. The turn is truncated at this point
    /// and `partial` holds everything that was durably persisted before it.
    #[error("persistence failed after {attempts} attempt(s): {source}")]
    Persistence {
        attempts: u32,
        #[source]
        source: SinkError,
        partial: Box<Turn>,
    },
    #[error("conversation append lock closed: {0}")]
    Ledger(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("transcript store unavailable: {0}")]
    Unavailable(String),
    #[error("transcript store returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid conversation id: {0}")]
    InvalidConversation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(String),
}

impl SinkError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::Rejected { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            Self::InvalidConversation(_) | Self::Serialization(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("event source disconnected: {0}")]
    Disconnected(String),
    #[error("failed to decode event: {0}")]
    Decode(String),
    #[error("reasoning cycle limit reached ({0})")]
    CycleLimit(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("raw message is malformed: {0}")]
    Malformed(String),
    #[error("unsupported role: {0}")]
    UnsupportedRole(String),
    #[error("raw message is missing `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveError {
    #[error("live consumer is not keeping up")]
    Backpressure,
    #[error("live consumer disconnected")]
    Disconnected,
}

/// A persisted turn that breaks one of the transcript ordering rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptViolation {
    #[error("message at sequence {sequence} could not be decoded: {source}")]
    Undecodable {
        sequence: u64,
        #[source]
        source: MessageError,
    },
    #[error("sequence {sequence} does not follow {previous}")]
    NonMonotonicSequence { previous: u64, sequence: u64 },
    #[error("tool result for `{0}` has no earlier tool call")]
    OrphanResult(String),
    #[error("tool call `{0}` has more than one result")]
    DuplicateResult(String),
    #[error("tool call `{0}` was declared more than once")]
    DuplicateCall(String),
    #[error("tool call `{0}` never received a result")]
    MissingResult(String),
    #[error("final answer at sequence {0} is not the last message")]
    FinalNotLast(u64),
    #[error("complete turn does not end with a final answer")]
    MissingFinal,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
