use crate::error::Result;

pub mod bincode;
pub mod json;
pub mod raw;
pub mod string;

pub use self::bincode::BincodeSerializer;
pub use self::json::JsonSerializer;
pub use self::raw::RawSerializer;
pub use self::string::StringSerializer;

/// Serializer trait for turning payload values into bytes and back
///
/// `encode` and `decode` must be exact inverses for every value `encode`
/// accepts. A failure is reported as an error, never as a partial value.
pub trait Serializer {
    /// The application-level payload type
    type Value;

    /// Encode a value into bytes
    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>>;

    /// Decode bytes into a value
    fn decode(&self, bytes: &[u8]) -> Result<Self::Value>;
}
