// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

// Standard library imports
use std::collections::HashMap;
use std::time::Duration;

// Third-party crates
use serde::Deserialize;

use crate::errors::ProxyError;

pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 10;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65536;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10000;
pub const DEFAULT_PRIORITY: u8 = 4;

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn default_max_concurrent_calls() -> usize {
    DEFAULT_MAX_CONCURRENT_CALLS
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

/// Static configuration of a request proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Broker destination the proxy listens on.
    pub destination_name: String,

    /// Priority applied to every outbound send.
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Worker pool size and permit capacity.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,

    /// Serialized responses above this size are fragmented.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Grace period for in-flight calls on stop.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Opaque properties handed to the broker adapter.
    #[serde(default)]
    pub connection_properties: HashMap<String, String>,
}

impl ProxyConfig {
    pub fn new(destination_name: impl Into<String>) -> Self {
        ProxyConfig {
            destination_name: destination_name.into(),
            priority: default_priority(),
            max_concurrent_calls: default_max_concurrent_calls(),
            max_message_size: default_max_message_size(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            connection_properties: HashMap::new(),
        }
    }

    pub fn with_priority(self, priority: u8) -> Self {
        ProxyConfig { priority, ..self }
    }

    pub fn with_max_concurrent_calls(self, max_concurrent_calls: usize) -> Self {
        ProxyConfig {
            max_concurrent_calls,
            ..self
        }
    }

    pub fn with_max_message_size(self, max_message_size: usize) -> Self {
        ProxyConfig {
            max_message_size,
            ..self
        }
    }

    pub fn with_shutdown_timeout_ms(self, shutdown_timeout_ms: u64) -> Self {
        ProxyConfig {
            shutdown_timeout_ms,
            ..self
        }
    }

    pub fn with_connection_properties(
        self,
        connection_properties: HashMap<String, String>,
    ) -> Self {
        ProxyConfig {
            connection_properties,
            ..self
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.destination_name.is_empty() {
            return Err(ProxyError::Config("destination name not set".to_string()));
        }
        if self.max_concurrent_calls < 1 {
            return Err(ProxyError::Config(
                "max_concurrent_calls cannot be lower than 1".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ProxyError::Config(
                "max_message_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
