use crate::error::{Error, Result};
use crate::serializer::Serializer;

/// UTF-8 text serializer, the default for channels
///
/// Decoding rejects bytes that are not valid UTF-8 instead of substituting
/// replacement characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer for StringSerializer {
    type Value = String;

    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::decode(e.to_string()))
    }
}
