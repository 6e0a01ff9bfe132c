// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

// Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Third-party crates
use bytes::Bytes;

use crate::errors::ProxyError;

/// Codec between an opaque byte buffer and a domain message value.
///
/// The id is the short ASCII tag carried in the `x-serializer-id` header
/// and must stay stable across versions of the codec.
pub trait MessageSerializer<M>: Send + Sync {
    fn id(&self) -> &'static str;
    fn serialize(&self, message: &M) -> Result<Bytes, ProxyError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<M, ProxyError>;
}

/// Serializers known to a proxy, keyed by [`MessageSerializer::id`].
pub struct SerializerRegistry<M> {
    serializers: HashMap<&'static str, Arc<dyn MessageSerializer<M>>>,
}

impl<M> Default for SerializerRegistry<M> {
    fn default() -> Self {
        SerializerRegistry {
            serializers: HashMap::new(),
        }
    }
}

impl<M> SerializerRegistry<M> {
    pub fn new() -> Self {
        SerializerRegistry::default()
    }

    /// Register a serializer; a later registration with the same id wins.
    pub fn insert(&mut self, serializer: Arc<dyn MessageSerializer<M>>) {
        self.serializers.insert(serializer.id(), serializer);
    }

    pub fn resolve(&self, id: &str) -> Option<Arc<dyn MessageSerializer<M>>> {
        self.serializers.get(id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.serializers.len()
    }
}

/// Plain-text codec for `String` domain messages; the default codec used
/// by the test suites and simple deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextSerializer;

impl MessageSerializer<String> for TextSerializer {
    fn id(&self) -> &'static str {
        "text"
    }

    fn serialize(&self, message: &String) -> Result<Bytes, ProxyError> {
        Ok(Bytes::copy_from_slice(message.as_bytes()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, ProxyError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| ProxyError::Deserialization(e.to_string()))
    }
}
