//! Opaque embedded documents.
//!
//! A document on the wire is a self-length-prefixed blob: the first four bytes
//! (little-endian int32) hold the total document length, prefix included. The codec
//! never looks past that prefix; structured access goes through the `bson` crate.

use crate::error::ProtocolError;
use bytes::Bytes;
use std::fmt;

/// Smallest legal document: length prefix plus the trailing NUL.
pub const MIN_DOCUMENT_SIZE: usize = 5;

const EMPTY_DOCUMENT: [u8; 5] = [5, 0, 0, 0, 0];

/// A pre-serialized document, carried verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct Document(Bytes);

impl Document {
    /// Wraps bytes that must hold exactly one document.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, ProtocolError> {
        if bytes.len() < MIN_DOCUMENT_SIZE {
            return Err(ProtocolError::InvalidDocument(format!(
                "{} bytes is shorter than the minimum of {}",
                bytes.len(),
                MIN_DOCUMENT_SIZE
            )));
        }
        let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if declared as i64 != bytes.len() as i64 {
            return Err(ProtocolError::InvalidDocument(format!(
                "declared length {} does not match {} bytes",
                declared,
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Wraps a slice already validated by the wire reader.
    pub(crate) fn from_validated(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// The empty document `{}`.
    pub fn empty() -> Self {
        Self(Bytes::from_static(&EMPTY_DOCUMENT))
    }

    /// Serializes a structured BSON document.
    pub fn from_bson(doc: &bson::Document) -> Result<Self, ProtocolError> {
        let mut buf = Vec::new();
        doc.to_writer(&mut buf)?;
        Ok(Self(Bytes::from(buf)))
    }

    /// Parses the blob into a structured BSON document.
    pub fn to_bson(&self) -> Result<bson::Document, ProtocolError> {
        Ok(bson::Document::from_reader(self.0.as_ref())?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether this is the empty document `{}`.
    pub fn is_empty(&self) -> bool {
        self.0.len() == MIN_DOCUMENT_SIZE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Document({} bytes)", self.0.len())
    }
}

impl AsRef<[u8]> for Document {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&bson::Document> for Document {
    type Error = ProtocolError;

    fn try_from(doc: &bson::Document) -> Result<Self, Self::Error> {
        Self::from_bson(doc)
    }
}
