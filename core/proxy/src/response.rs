// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

// Standard library imports
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Third-party crates
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

// Local crate
use courier_datapath::broker::BrokerProducer;
use courier_datapath::messages::{
    now_millis, Destination, Message, MessageType, ProtocolVersion, HDR_ERROR_KIND,
    HDR_FRAGMENT_TOTAL,
};

use crate::errors::ProxyError;
use crate::metrics::ServerMetrics;
use crate::serializer::MessageSerializer;

/// Reply side of one active call.
///
/// Owns the reply destination and streams the handler's responses back,
/// fragmenting anything larger than the configured maximum message size.
/// Writing the terminal end-of-stream or error marker closes the context;
/// later writes are dropped silently since they may arrive from a late
/// handler.
pub struct ResponseContext<M> {
    call_id: String,
    reply_to: Destination,
    deadline: u64,
    protocol_version: ProtocolVersion,
    serializer: Arc<dyn MessageSerializer<M>>,
    max_message_size: usize,
    priority: u8,
    producer: Arc<dyn BrokerProducer>,
    metrics: Arc<ServerMetrics>,
    closed: AtomicBool,
    // serializes writes so responses leave in send_response order
    send_lock: Mutex<()>,
}

impl<M> ResponseContext<M>
where
    M: Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        call_id: String,
        reply_to: Destination,
        deadline: u64,
        protocol_version: ProtocolVersion,
        serializer: Arc<dyn MessageSerializer<M>>,
        max_message_size: usize,
        priority: u8,
        producer: Arc<dyn BrokerProducer>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        ResponseContext {
            call_id,
            reply_to,
            deadline,
            protocol_version,
            serializer,
            max_message_size,
            priority,
            producer,
            metrics,
            closed: AtomicBool::new(false),
            send_lock: Mutex::new(()),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// True once a terminal marker was written or the call deadline has
    /// passed; closed contexts are collected by the call-table sweep.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || now_millis() >= self.deadline
    }

    /// Serialize and send one response on the reply destination. Fragments
    /// the payload when it exceeds the maximum message size. Drops silently
    /// on a closed context; converts to an end-of-stream once the deadline
    /// has passed.
    pub async fn send_response(&self, message: &M) -> Result<(), ProxyError> {
        if self.closed.load(Ordering::Acquire) {
            trace!(call_id = %self.call_id, "dropping response on closed context");
            return Ok(());
        }

        if now_millis() >= self.deadline {
            debug!(call_id = %self.call_id, "response past deadline, closing stream");
            return self.end_of_stream().await;
        }

        let payload = self.serializer.serialize(message)?;

        let _guard = self.send_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        if payload.len() > self.max_message_size {
            let total = payload.len().div_ceil(self.max_message_size) as u32;
            debug!(
                call_id = %self.call_id,
                bytes = payload.len(),
                fragments = total,
                "fragmenting response",
            );

            for index in 0..total {
                let start = index as usize * self.max_message_size;
                let end = usize::min(start + self.max_message_size, payload.len());
                let fragment = Message::new(MessageType::ResponseFragment, self.protocol_version)
                    .with_call_id(&self.call_id)
                    .with_fragment(index, total)
                    .with_payload(payload.slice(start..end));
                self.send(fragment).await?;
            }

            let end_marker = Message::new(MessageType::ResponseFragmentEnd, self.protocol_version)
                .with_call_id(&self.call_id)
                .with_header(HDR_FRAGMENT_TOTAL, total);
            self.send(end_marker).await?;
        } else {
            let response = Message::new(MessageType::Response, self.protocol_version)
                .with_call_id(&self.call_id)
                .with_payload(payload);
            self.send(response).await?;
        }

        Ok(())
    }

    /// Send the terminal end-of-stream marker and close the context.
    pub async fn end_of_stream(&self) -> Result<(), ProxyError> {
        let _guard = self.send_lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!(call_id = %self.call_id, "end of stream");
        let marker = Message::new(MessageType::EndOfStream, self.protocol_version)
            .with_call_id(&self.call_id);
        self.send(marker).await
    }

    /// Send a terminal error marker and close the context. The handler
    /// fault is counted once; a failure to deliver the marker itself is a
    /// separate broker error and is counted independently. Reporting on an
    /// already closed context is a no-op and is not re-counted.
    pub async fn report_error(&self, kind: &str, detail: &str) -> Result<(), ProxyError> {
        let _guard = self.send_lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        warn!(call_id = %self.call_id, %kind, %detail, "closing call with error");
        self.metrics.error();

        let marker = Message::new(MessageType::Error, self.protocol_version)
            .with_call_id(&self.call_id)
            .with_header(HDR_ERROR_KIND, kind)
            .with_payload(detail.as_bytes().to_vec());
        self.send(marker).await
    }

    async fn send(&self, message: Message) -> Result<(), ProxyError> {
        match self
            .producer
            .send(&self.reply_to, message, self.priority)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // a failed reply send closes this call; the proxy goes on
                self.closed.store(true, Ordering::Release);
                self.metrics.error();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::TextSerializer;
    use courier_datapath::broker::BrokerConnection;
    use courier_testing::InMemoryBroker;
    use std::time::Duration;

    async fn setup(
        max_message_size: usize,
        deadline: u64,
    ) -> (
        ResponseContext<String>,
        tokio::sync::mpsc::Receiver<Result<Message, courier_datapath::errors::BrokerError>>,
    ) {
        let broker = InMemoryBroker::new();
        let reply_to = Destination::new("replies");
        let rx = broker.subscribe(&reply_to).await.unwrap();
        let producer = broker.create_producer().await.unwrap();

        let ctx = ResponseContext::new(
            "c1".to_string(),
            reply_to,
            deadline,
            ProtocolVersion::V1,
            Arc::new(TextSerializer),
            max_message_size,
            4,
            producer,
            Arc::new(ServerMetrics::new()),
        );
        (ctx, rx)
    }

    async fn recv(
        rx: &mut tokio::sync::mpsc::Receiver<
            Result<Message, courier_datapath::errors::BrokerError>,
        >,
    ) -> Message {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("reply channel closed")
            .expect("broker error")
    }

    #[tokio::test]
    async fn test_response_then_end_of_stream() {
        let (ctx, mut rx) = setup(1024, now_millis() + 10_000).await;

        ctx.send_response(&"pong".to_string()).await.unwrap();
        ctx.end_of_stream().await.unwrap();
        assert!(ctx.is_closed());

        let response = recv(&mut rx).await;
        assert_eq!(response.message_type().unwrap(), MessageType::Response);
        assert_eq!(response.call_id(), Some("c1"));
        assert_eq!(response.payload().as_ref(), b"pong");

        let marker = recv(&mut rx).await;
        assert_eq!(marker.message_type().unwrap(), MessageType::EndOfStream);
    }

    #[tokio::test]
    async fn test_fragmented_response() {
        let (ctx, mut rx) = setup(64, now_millis() + 10_000).await;

        // 200 bytes -> fragments of 64, 64, 64, 8
        let body = "x".repeat(200);
        ctx.send_response(&body).await.unwrap();
        ctx.end_of_stream().await.unwrap();

        let mut reassembled = Vec::new();
        for expected_index in 0..4u32 {
            let fragment = recv(&mut rx).await;
            assert_eq!(
                fragment.message_type().unwrap(),
                MessageType::ResponseFragment
            );
            assert_eq!(fragment.fragment_index().unwrap(), expected_index);
            assert_eq!(fragment.fragment_total().unwrap(), 4);
            reassembled.extend_from_slice(fragment.payload());
        }
        assert_eq!(reassembled.len(), 200);
        assert_eq!(reassembled, body.as_bytes());

        let end_marker = recv(&mut rx).await;
        assert_eq!(
            end_marker.message_type().unwrap(),
            MessageType::ResponseFragmentEnd
        );

        let eos = recv(&mut rx).await;
        assert_eq!(eos.message_type().unwrap(), MessageType::EndOfStream);
    }

    #[tokio::test]
    async fn test_sends_after_close_are_dropped() {
        let (ctx, mut rx) = setup(1024, now_millis() + 10_000).await;

        ctx.end_of_stream().await.unwrap();
        ctx.send_response(&"late".to_string()).await.unwrap();
        ctx.end_of_stream().await.unwrap();
        ctx.report_error("handler", "late failure").await.unwrap();

        let marker = recv(&mut rx).await;
        assert_eq!(marker.message_type().unwrap(), MessageType::EndOfStream);

        // nothing else was sent
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_error_counted_once() {
        let broker = InMemoryBroker::new();
        let reply_to = Destination::new("replies");
        let mut rx = broker.subscribe(&reply_to).await.unwrap();
        let producer = broker.create_producer().await.unwrap();
        let metrics = Arc::new(ServerMetrics::new());

        let ctx: ResponseContext<String> = ResponseContext::new(
            "c1".to_string(),
            reply_to,
            now_millis() + 10_000,
            ProtocolVersion::V1,
            Arc::new(TextSerializer),
            1024,
            4,
            producer,
            metrics.clone(),
        );

        ctx.report_error("handler", "boom").await.unwrap();
        ctx.report_error("handler", "boom again").await.unwrap();
        assert_eq!(metrics.snapshot().errors, 1);

        let marker = recv(&mut rx).await;
        assert_eq!(marker.message_type().unwrap(), MessageType::Error);
        assert_eq!(marker.header(HDR_ERROR_KIND), Some("handler"));
        assert_eq!(marker.payload().as_ref(), b"boom");
    }

    #[tokio::test]
    async fn test_failed_error_reply_counts_broker_error() {
        let broker = InMemoryBroker::new();
        // nobody is subscribed on the reply destination, so sends fail
        let producer = broker.create_producer().await.unwrap();
        let metrics = Arc::new(ServerMetrics::new());

        let ctx: ResponseContext<String> = ResponseContext::new(
            "c1".to_string(),
            Destination::new("gone"),
            now_millis() + 10_000,
            ProtocolVersion::V1,
            Arc::new(TextSerializer),
            1024,
            4,
            producer,
            metrics.clone(),
        );

        let err = ctx.report_error("handler", "boom").await.unwrap_err();
        assert!(matches!(err, ProxyError::Broker(_)));
        // one count for the handler fault, one for the failed delivery
        assert_eq!(metrics.snapshot().errors, 2);
        assert!(ctx.is_closed());

        // the context is closed now, nothing further is counted
        ctx.report_error("handler", "boom again").await.unwrap();
        assert_eq!(metrics.snapshot().errors, 2);
    }

    #[tokio::test]
    async fn test_write_past_deadline_closes_stream() {
        let (ctx, mut rx) = setup(1024, now_millis().saturating_sub(1)).await;

        assert!(ctx.is_closed());
        ctx.send_response(&"too late".to_string()).await.unwrap();

        // the write converted into a timeout-close
        let marker = recv(&mut rx).await;
        assert_eq!(marker.message_type().unwrap(), MessageType::EndOfStream);
    }
}
