// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

// Standard library imports
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

// Third-party crates
use bytes::Bytes;
use rand::Rng;

use crate::errors::MessageError;

// header vocabulary carried on every broker message
pub const HDR_MESSAGE_TYPE: &str = "x-msg-type";
pub const HDR_PROTOCOL_VERSION: &str = "x-proto-ver";
pub const HDR_SERIALIZER_ID: &str = "x-serializer-id";
pub const HDR_REQUEST_TIMEOUT: &str = "x-req-timeout";
pub const HDR_FRAGMENT_INDEX: &str = "x-frag-idx";
pub const HDR_FRAGMENT_TOTAL: &str = "x-frag-total";
pub const HDR_MAX_FRAGMENT_SIZE: &str = "x-max-frag-size";
pub const HDR_ERROR_KIND: &str = "x-error-kind";

/// Maximum accepted length of a serializer id, in bytes.
pub const MAX_SERIALIZER_ID_LEN: usize = 32;

// prefix used for broker-private temporary destinations
const TEMPORARY_PREFIX: &str = "$TMP$";

/// Milliseconds since the unix epoch, the time base of `x-req-timeout`.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Message type tag carried in the `x-msg-type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// one-shot request payload
    Signal,
    /// announcement that a fragmented upload will follow
    ChannelRequest,
    /// advertisement of the private upload destination
    ChannelSetup,
    /// one fragment of an upload
    ChannelUpload,
    /// end marker of a fragmented upload
    ChannelEnd,
    /// single response message
    Response,
    /// one fragment of an oversized response
    ResponseFragment,
    /// end marker of a fragmented response
    ResponseFragmentEnd,
    /// terminal end-of-stream marker
    EndOfStream,
    /// terminal error marker
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Signal => "signal",
            MessageType::ChannelRequest => "channel-request",
            MessageType::ChannelSetup => "channel-setup",
            MessageType::ChannelUpload => "channel-upload",
            MessageType::ChannelEnd => "channel-end",
            MessageType::Response => "response",
            MessageType::ResponseFragment => "response-fragment",
            MessageType::ResponseFragmentEnd => "response-fragment-end",
            MessageType::EndOfStream => "end-of-stream",
            MessageType::Error => "error",
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signal" => Ok(MessageType::Signal),
            "channel-request" => Ok(MessageType::ChannelRequest),
            "channel-setup" => Ok(MessageType::ChannelSetup),
            "channel-upload" => Ok(MessageType::ChannelUpload),
            "channel-end" => Ok(MessageType::ChannelEnd),
            "response" => Ok(MessageType::Response),
            "response-fragment" => Ok(MessageType::ResponseFragment),
            "response-fragment-end" => Ok(MessageType::ResponseFragmentEnd),
            "end-of-stream" => Ok(MessageType::EndOfStream),
            "error" => Ok(MessageType::Error),
            other => Err(MessageError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Protocol version negotiated in the `x-proto-ver` header.
///
/// All contexts associated with one call share a version. Minor variance
/// within a known tag is tolerated by the individual contexts; an unknown
/// tag is the only cross-version gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn tag(&self) -> u32 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(ProtocolVersion::V1),
            2 => Some(ProtocolVersion::V2),
            _ => None,
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.tag())
    }
}

/// A broker-addressable endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination(String);

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        Destination(name.into())
    }

    /// Derive a fresh private destination name, used for per-upload
    /// transient reply channels.
    pub fn temporary() -> Self {
        let suffix: u64 = rand::rng().random();
        Destination(format!("{}{:016x}", TEMPORARY_PREFIX, suffix))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Destination::new(name)
    }
}

/// One broker message: an opaque byte payload plus string-scalar headers,
/// with the correlation id and the reply destination as broker-native
/// fields.
#[derive(Debug, Clone)]
pub struct Message {
    call_id: Option<String>,
    reply_to: Option<Destination>,
    headers: HashMap<String, String>,
    payload: Bytes,
}

impl Message {
    /// Create a message tagged with a type and protocol version. Everything
    /// else is attached with the `with_*` builders below.
    pub fn new(message_type: MessageType, version: ProtocolVersion) -> Self {
        let mut headers = HashMap::new();
        headers.insert(HDR_MESSAGE_TYPE.to_string(), message_type.as_str().to_string());
        headers.insert(HDR_PROTOCOL_VERSION.to_string(), version.tag().to_string());

        Message {
            call_id: None,
            reply_to: None,
            headers,
            payload: Bytes::new(),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: Destination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.headers.insert(key.into(), value.to_string());
        self
    }

    pub fn with_deadline(self, deadline_ms: u64) -> Self {
        self.with_header(HDR_REQUEST_TIMEOUT, deadline_ms)
    }

    pub fn with_serializer_id(self, id: &str) -> Self {
        self.with_header(HDR_SERIALIZER_ID, id)
    }

    pub fn with_fragment(self, index: u32, total: u32) -> Self {
        self.with_header(HDR_FRAGMENT_INDEX, index)
            .with_header(HDR_FRAGMENT_TOTAL, total)
    }

    // accessors

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&Destination> {
        self.reply_to.as_ref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn message_type(&self) -> Result<MessageType, MessageError> {
        self.header(HDR_MESSAGE_TYPE)
            .ok_or(MessageError::HeaderNotFound(HDR_MESSAGE_TYPE))?
            .parse()
    }

    /// Raw protocol version tag; whether the tag is a known one is decided
    /// by the receiver.
    pub fn protocol_version_tag(&self) -> Result<u32, MessageError> {
        self.u32_header(HDR_PROTOCOL_VERSION)
    }

    pub fn serializer_id(&self) -> Result<&str, MessageError> {
        let id = self
            .header(HDR_SERIALIZER_ID)
            .ok_or(MessageError::HeaderNotFound(HDR_SERIALIZER_ID))?;
        if id.len() > MAX_SERIALIZER_ID_LEN {
            return Err(MessageError::SerializerIdTooLong(id.len()));
        }
        Ok(id)
    }

    /// Absolute call deadline, milliseconds since the unix epoch.
    pub fn deadline(&self) -> Result<u64, MessageError> {
        self.u64_header(HDR_REQUEST_TIMEOUT)
    }

    pub fn fragment_index(&self) -> Result<u32, MessageError> {
        self.u32_header(HDR_FRAGMENT_INDEX)
    }

    pub fn fragment_total(&self) -> Result<u32, MessageError> {
        self.u32_header(HDR_FRAGMENT_TOTAL)
    }

    pub fn max_fragment_size(&self) -> Result<usize, MessageError> {
        self.u64_header(HDR_MAX_FRAGMENT_SIZE).map(|v| v as usize)
    }

    fn u32_header(&self, key: &'static str) -> Result<u32, MessageError> {
        let value = self.header(key).ok_or(MessageError::HeaderNotFound(key))?;
        value.parse().map_err(|_| MessageError::InvalidHeader {
            header: key,
            value: value.to_string(),
        })
    }

    fn u64_header(&self, key: &'static str) -> Result<u64, MessageError> {
        let value = self.header(key).ok_or(MessageError::HeaderNotFound(key))?;
        value.parse().map_err(|_| MessageError::InvalidHeader {
            header: key,
            value: value.to_string(),
        })
    }
}
