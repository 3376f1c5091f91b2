use courier_db::StoreError;

/// An inbound frame or broker payload that cannot be acted on. Logged and
/// dropped; never closes a connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("direct envelope has no recipient")]
    MissingRecipient,

    #[error("message id {0} is not numeric")]
    BadMessageId(String),

    #[error("emoji {0} is not a supported reaction")]
    UnknownEmoji(String),

    #[error("message body is empty")]
    EmptyBody,
}

/// A send or receive failure on one connection.
#[derive(Debug, thiserror::Error)]
#[error("connection transport failed: {0}")]
pub struct TransportError(pub String);

/// Failure while handling one client command. Only the command is lost.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode envelope: {0}")]
    Encode(serde_json::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
