use thiserror::Error;

/// Client-side failure set. Everything the SDK surfaces to a host
/// application is one of these; nothing propagates as a panic or a silent
/// default.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("not a contact: {0}")]
    NotAContact(String),
    #[error("no delivery endpoint known for {0}")]
    NoEndpoint(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("retry queue is full")]
    QueueFull,
    #[error("message expired in the retry queue")]
    Expired,
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("unknown community: {0}")]
    UnknownCommunity(String),
    #[error("relay error ({status}): {message}")]
    Relay { status: u16, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
}
