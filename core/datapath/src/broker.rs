// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Adapter traits a concrete broker binding implements. The library core
//! never talks to a broker directly: it sends through a [`BrokerProducer`]
//! and receives through the channel handed out by
//! [`BrokerConnection::subscribe`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::BrokerError;
use crate::messages::{Destination, Message};

/// Inbound side of a subscription. Each received item is either a message
/// delivered on the subscribed destination or a fatal adapter report; the
/// channel closing means the subscription is gone.
pub type InboundReceiver = mpsc::Receiver<Result<Message, BrokerError>>;

/// Outbound producer. Producers are not bound to a destination; the
/// destination is supplied per send. Deliveries are non-persistent.
///
/// Implementations state whether `send` may be called concurrently; the
/// library serializes per-call response writes on its own but shares one
/// producer across calls.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn send(
        &self,
        destination: &Destination,
        message: Message,
        priority: u8,
    ) -> Result<(), BrokerError>;
}

/// One logical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a producer without a bound destination.
    async fn create_producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError>;

    /// Open a consumer on a named destination. The returned channel is the
    /// callback registration: the adapter pushes inbound messages into it
    /// and the receiver task exerts backpressure by not draining it.
    async fn subscribe(&self, destination: &Destination) -> Result<InboundReceiver, BrokerError>;

    /// Create a transient private destination, addressable until the
    /// connection goes away.
    async fn create_temporary_destination(&self) -> Result<Destination, BrokerError>;
}
