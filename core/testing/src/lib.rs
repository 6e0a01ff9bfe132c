// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Test support for the courier crates: a fully in-process broker that
//! implements the datapath adapter traits. Destinations are plain channels,
//! so tests can subscribe to a reply destination and observe exactly what a
//! client on the other side of a real broker would see.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use courier_datapath::broker::{BrokerConnection, BrokerProducer, InboundReceiver};
use courier_datapath::errors::BrokerError;
use courier_datapath::messages::{Destination, Message};

// matches the channel capacity the library uses for app channels
const DEFAULT_CAPACITY: usize = 128;

struct BrokerState {
    destinations: RwLock<HashMap<Destination, mpsc::Sender<Result<Message, BrokerError>>>>,
    capacity: usize,
}

/// An in-process broker. Cloning shares the underlying destination table,
/// so a test can hand one clone to the proxy and keep another for itself.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity of each destination channel. A small capacity makes broker
    /// backpressure observable in tests.
    pub fn with_capacity(capacity: usize) -> Self {
        InMemoryBroker {
            state: Arc::new(BrokerState {
                destinations: RwLock::new(HashMap::new()),
                capacity,
            }),
        }
    }

    /// Deliver a fatal adapter report to the consumer of `destination`,
    /// simulating a dropped broker connection.
    pub async fn inject_fatal(&self, destination: &Destination, detail: &str) {
        let sender = self.state.destinations.read().get(destination).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(Err(BrokerError::Fatal(detail.to_string()))).await;
        }
    }

    /// Drop the subscription on `destination`; later sends to it fail.
    pub fn drop_destination(&self, destination: &Destination) {
        self.state.destinations.write().remove(destination);
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn create_producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        Ok(Arc::new(InMemoryProducer {
            state: self.state.clone(),
        }))
    }

    async fn subscribe(&self, destination: &Destination) -> Result<InboundReceiver, BrokerError> {
        let mut destinations = self.state.destinations.write();
        if destinations.contains_key(destination) {
            return Err(BrokerError::AlreadySubscribed(destination.to_string()));
        }

        debug!(%destination, "subscribing consumer");
        let (tx, rx) = mpsc::channel(self.state.capacity);
        destinations.insert(destination.clone(), tx);
        Ok(rx)
    }

    async fn create_temporary_destination(&self) -> Result<Destination, BrokerError> {
        Ok(Destination::temporary())
    }
}

struct InMemoryProducer {
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerProducer for InMemoryProducer {
    // priority is accepted for interface fidelity; a channel has no
    // priority lanes
    async fn send(
        &self,
        destination: &Destination,
        message: Message,
        _priority: u8,
    ) -> Result<(), BrokerError> {
        let sender = self
            .state
            .destinations
            .read()
            .get(destination)
            .cloned()
            .ok_or_else(|| BrokerError::DestinationNotFound(destination.to_string()))?;

        sender
            .send(Ok(message))
            .await
            .map_err(|_| BrokerError::Send(format!("consumer gone on {}", destination)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_datapath::messages::{MessageType, ProtocolVersion};

    #[tokio::test]
    async fn test_publish_subscribe() {
        let broker = InMemoryBroker::new();
        let dest = Destination::new("requests");
        let mut rx = broker.subscribe(&dest).await.unwrap();

        let producer = broker.create_producer().await.unwrap();
        let msg = Message::new(MessageType::Signal, ProtocolVersion::V1)
            .with_call_id("c1")
            .with_payload("ping".as_bytes());
        producer.send(&dest, msg, 4).await.unwrap();

        let received = rx.recv().await.unwrap().unwrap();
        assert_eq!(received.call_id(), Some("c1"));
        assert_eq!(received.payload().as_ref(), b"ping");
    }

    #[tokio::test]
    async fn test_send_to_unknown_destination() {
        let broker = InMemoryBroker::new();
        let producer = broker.create_producer().await.unwrap();

        let msg = Message::new(MessageType::Signal, ProtocolVersion::V1);
        let err = producer
            .send(&Destination::new("nowhere"), msg, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::DestinationNotFound(_)));
    }

    #[tokio::test]
    async fn test_double_subscribe_rejected() {
        let broker = InMemoryBroker::new();
        let dest = Destination::new("requests");
        let _rx = broker.subscribe(&dest).await.unwrap();
        let err = broker.subscribe(&dest).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadySubscribed(_)));
    }

    #[tokio::test]
    async fn test_inject_fatal() {
        let broker = InMemoryBroker::new();
        let dest = Destination::new("requests");
        let mut rx = broker.subscribe(&dest).await.unwrap();

        broker.inject_fatal(&dest, "connection dropped").await;
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Err(BrokerError::Fatal(_))));
    }
}
