//! DataPacket -- one transfer unit: attributes plus content bytes.

use bytes::Bytes;
use std::collections::BTreeMap;

/// An immutable unit of data handed to a transaction.
///
/// Attribute keys are unique and framed in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    attributes: BTreeMap<String, String>,
    content: Bytes,
}

impl DataPacket {
    pub fn new(attributes: BTreeMap<String, String>, content: impl Into<Bytes>) -> Self {
        Self {
            attributes,
            content: content.into(),
        }
    }

    /// Build a packet from `(key, value)` pairs. Later duplicates win.
    pub fn from_pairs<K, V, I>(pairs: I, content: impl Into<Bytes>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let attributes = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(attributes, content)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Content size in bytes.
    pub fn size(&self) -> i64 {
        self.content.len() as i64
    }

    pub fn into_parts(self) -> (BTreeMap<String, String>, Bytes) {
        (self.attributes, self.content)
    }
}
