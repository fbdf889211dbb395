use super::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;

/// Serializes a value to JSON bytes.
///
/// # Errors
/// Returns `CoreError::Serialization` if the value cannot be serialized.
pub fn serialize_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(CoreError::Serialization)
}

/// Serializes a value to indented JSON bytes, for files meant to be read by people.
pub fn serialize_value_pretty<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(CoreError::Serialization)
}

/// Deserializes JSON bytes to a value.
///
/// # Errors
/// Returns `CoreError::Deserialization` if the bytes cannot be deserialized.
pub fn deserialize_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(CoreError::Deserialization)
}

/// Returns the number of bytes `value` occupies when serialized as compact JSON.
///
/// Counts through a sink writer so nothing is buffered.
pub fn serialized_size<T: Serialize + ?Sized>(value: &T) -> Result<usize> {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, value).map_err(CoreError::Serialization)?;
    Ok(counter.0)
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
