// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("header not found: {0}")]
    HeaderNotFound(&'static str),
    #[error("invalid value for header {header}: {value}")]
    InvalidHeader {
        header: &'static str,
        value: String,
    },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unknown protocol version: {0}")]
    UnknownProtocolVersion(u32),
    #[error("correlation id not found")]
    CallIdNotFound,
    #[error("reply destination not found")]
    ReplyDestinationNotFound,
    #[error("serializer id too long: {0} bytes")]
    SerializerIdTooLong(usize),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("destination not found: {0}")]
    DestinationNotFound(String),
    #[error("destination already subscribed: {0}")]
    AlreadySubscribed(String),
    #[error("broker channel closed")]
    ChannelClosed,
    #[error("error sending message: {0}")]
    Send(String),
    #[error("error subscribing to destination: {0}")]
    Subscribe(String),
    #[error("fatal broker error: {0}")]
    Fatal(String),
}
