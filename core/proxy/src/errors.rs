// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

// Third-party crates
use thiserror::Error;

// Local crate
use courier_datapath::errors::{BrokerError, MessageError};

#[derive(Error, Debug)]
pub enum ProxyError {
    // Configuration and lifecycle
    #[error("configuration error: {0}")]
    Config(String),
    #[error("proxy not started")]
    NotStarted,
    #[error("proxy already started")]
    AlreadyStarted,

    // Transport
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    // Message processing and validation
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("unknown serializer: {0}")]
    UnknownSerializer(String),
    #[error("error serializing message: {0}")]
    Serialization(String),
    #[error("error deserializing message: {0}")]
    Deserialization(String),

    // Call state machine
    #[error("call {0} already has an upload channel in progress")]
    UploadInProgress(String),
    #[error("unexpected message type on upload channel: {0}")]
    UnexpectedMessageType(String),

    // Downstream handler
    #[error("handler error: {0}")]
    Handler(String),
}
