use thiserror::Error;

/// Failure raised by a [`Serializer`](crate::Serializer) while converting a
/// value to or from bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl Error {
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
