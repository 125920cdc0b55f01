//! Plist codec
//!
//! Typed values are encoded by wrapping them in a single element array, since
//! a plist document needs a container at its root. Decoding unwraps exactly
//! one element again. All functions here are pure and can be used from any
//! thread.

use std::io::Cursor;

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Encoding used when writing a plist document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlistFormat {
    Xml,
    #[default]
    Binary,
}

/// Encodes `value` as a binary plist wrapped in a single element array
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    encode_as(value, PlistFormat::Binary)
}

/// Encodes `value` wrapped in a single element array using `format`
pub fn encode_as<T: Serialize + ?Sized>(value: &T, format: PlistFormat) -> Result<Vec<u8>> {
    let wrapped = [value];
    write_document(&wrapped, format)
}

/// Decodes a document produced by [`encode`], unwrapping the root array
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut wrapped: Vec<T> = plist::from_bytes(bytes)?;

    if wrapped.len() != 1 {
        return Err(Error::codec(format!(
            "expected a single wrapped value, found {}",
            wrapped.len()
        )));
    }

    Ok(wrapped.remove(0))
}

/// Converts a typed value into a [`plist::Value`] through the wrapped encoding
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<plist::Value> {
    decode(&encode(value)?)
}

/// Converts a [`plist::Value`] into a typed value through the wrapped encoding
pub fn from_value<T: DeserializeOwned>(value: &plist::Value) -> Result<T> {
    decode(&encode(value)?)
}

/// Writes a root document (dictionary or array) without any wrapping
pub fn write_document<T: Serialize + ?Sized>(value: &T, format: PlistFormat) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());

    match format {
        PlistFormat::Xml => plist::to_writer_xml(&mut buf, &value)?,
        PlistFormat::Binary => plist::to_writer_binary(&mut buf, &value)?,
    }

    Ok(buf.into_inner())
}

/// Reads a root document in either encoding
pub fn read_document<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(plist::from_bytes(bytes)?)
}
