//! Codec Module
//!
//! Converts keys and values to the opaque byte representation stored remotely.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CacheError, Result};

// == Codec ==
/// Encodes values to bytes and decodes them back.
///
/// Implementations must satisfy `decode(encode(v)) == v`.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

// == UTF-8 Codec ==
/// Stores strings as their raw UTF-8 bytes, so keys stay readable in the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

// == Bytes Codec ==
/// Identity codec for values that already are bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

// == JSON Codec ==
/// Serializes any serde type as JSON.
#[derive(Debug)]
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
