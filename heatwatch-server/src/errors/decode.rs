#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Payload is empty")]
    Empty,

    #[error("Malformed JSON object: {0}")]
    MalformedJson(String),

    #[error("Payload {0:?} is not a number")]
    NotNumeric(String),

    #[error("Payload {0:?} is not a finite number")]
    NonFinite(String),
}
