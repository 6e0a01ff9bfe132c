// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Wire-level building blocks shared by the courier request/response
//! messaging library: the broker message model with its header vocabulary,
//! protocol version tags, and the adapter traits a concrete broker binding
//! has to implement.

pub mod broker;
pub mod errors;
pub mod messages;

pub use broker::{BrokerConnection, BrokerProducer, InboundReceiver};
pub use errors::{BrokerError, MessageError};
pub use messages::{Destination, Message, MessageType, ProtocolVersion};
