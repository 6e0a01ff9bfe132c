// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

// Standard library imports
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Third-party crates
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// Local crate
use courier_datapath::broker::InboundReceiver;
use courier_datapath::messages::{now_millis, Destination, Message, MessageType, ProtocolVersion};

use crate::errors::ProxyError;
use crate::metrics::ServerMetrics;
use crate::serializer::MessageSerializer;

/// A fully reassembled upload, handed back to the proxy so it can promote
/// the call to a response context and invoke the handler.
pub(crate) struct CompletedUpload<M> {
    pub call_id: String,
    pub data: Bytes,
    pub reply_to: Destination,
    pub deadline: u64,
    pub protocol_version: ProtocolVersion,
    pub serializer: Arc<dyn MessageSerializer<M>>,
}

struct ReassemblyState {
    // sequence-indexed so concatenation runs in fragment order no matter
    // how the broker interleaved delivery
    fragments: BTreeMap<u32, Bytes>,
    expected_total: Option<u32>,
}

/// Upload side of one fragmented call: owns the private reply destination,
/// collects fragments delivered on it, and reports the reassembled request
/// through a completion channel supplied at listener start.
pub struct UploadContext<M> {
    call_id: String,
    upload_destination: Destination,
    reply_to: Destination,
    deadline: u64,
    protocol_version: ProtocolVersion,
    serializer: Arc<dyn MessageSerializer<M>>,
    metrics: Arc<ServerMetrics>,
    state: Mutex<ReassemblyState>,
    closed: AtomicBool,
    cancellation_token: CancellationToken,
}

impl<M> UploadContext<M>
where
    M: Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        call_id: String,
        upload_destination: Destination,
        reply_to: Destination,
        deadline: u64,
        protocol_version: ProtocolVersion,
        serializer: Arc<dyn MessageSerializer<M>>,
        metrics: Arc<ServerMetrics>,
        cancellation_token: CancellationToken,
    ) -> Self {
        UploadContext {
            call_id,
            upload_destination,
            reply_to,
            deadline,
            protocol_version,
            serializer,
            metrics,
            state: Mutex::new(ReassemblyState {
                fragments: BTreeMap::new(),
                expected_total: None,
            }),
            closed: AtomicBool::new(false),
            cancellation_token,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn upload_destination(&self) -> &Destination {
        &self.upload_destination
    }

    /// True once the upload completed, failed, or outlived its deadline;
    /// closed contexts are collected by the call-table sweep.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || now_millis() >= self.deadline
    }

    /// Consume fragments from the private destination until the upload
    /// completes, the deadline passes, or the proxy shuts down. Runs as its
    /// own task so a slow uploader never occupies a worker.
    pub(crate) fn spawn_listener(
        self: &Arc<Self>,
        mut rx: InboundReceiver,
        completed_tx: mpsc::Sender<CompletedUpload<M>>,
    ) {
        let ctx = self.clone();

        tokio::spawn(async move {
            let remaining = Duration::from_millis(ctx.deadline.saturating_sub(now_millis()));
            let timeout = time::sleep(remaining);
            tokio::pin!(timeout);

            loop {
                tokio::select! {
                    _ = ctx.cancellation_token.cancelled() => {
                        debug!(call_id = %ctx.call_id, "upload listener cancelled");
                        ctx.closed.store(true, Ordering::Release);
                        break;
                    }
                    _ = timeout.as_mut() => {
                        debug!(call_id = %ctx.call_id, "upload timed out");
                        ctx.closed.store(true, Ordering::Release);
                        break;
                    }
                    next = rx.recv() => match next {
                        None => {
                            debug!(call_id = %ctx.call_id, "upload channel closed");
                            ctx.closed.store(true, Ordering::Release);
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(call_id = %ctx.call_id, error = %e, "broker error on upload channel");
                            ctx.metrics.error();
                            ctx.closed.store(true, Ordering::Release);
                            break;
                        }
                        Some(Ok(msg)) => match ctx.on_upload_message(msg) {
                            Ok(Some(data)) => {
                                debug!(
                                    call_id = %ctx.call_id,
                                    bytes = data.len(),
                                    "upload complete",
                                );
                                ctx.closed.store(true, Ordering::Release);
                                let completed = CompletedUpload {
                                    call_id: ctx.call_id.clone(),
                                    data,
                                    reply_to: ctx.reply_to.clone(),
                                    deadline: ctx.deadline,
                                    protocol_version: ctx.protocol_version,
                                    serializer: ctx.serializer.clone(),
                                };
                                if completed_tx.send(completed).await.is_err() {
                                    warn!(call_id = %ctx.call_id, "proxy gone, dropping completed upload");
                                }
                                break;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(call_id = %ctx.call_id, error = %e, "ignoring malformed upload message");
                                ctx.metrics.incompatible_message();
                            }
                        }
                    }
                }
            }
        });
    }

    /// Feed one message received on the private destination into the
    /// reassembly state. Returns the concatenated request bytes when the
    /// upload is complete.
    fn on_upload_message(&self, msg: Message) -> Result<Option<Bytes>, ProxyError> {
        match msg.message_type()? {
            MessageType::ChannelUpload => {
                let index = msg.fragment_index()?;
                let mut state = self.state.lock();
                state.fragments.insert(index, msg.payload().clone());
                if let Ok(total) = msg.fragment_total() {
                    state.expected_total = Some(total);
                }

                match state.expected_total {
                    Some(total) if state.fragments.len() as u32 >= total => {
                        Ok(Some(Self::concatenate(&state)))
                    }
                    _ => Ok(None),
                }
            }
            MessageType::ChannelEnd => {
                let state = self.state.lock();
                Ok(Some(Self::concatenate(&state)))
            }
            other => Err(ProxyError::UnexpectedMessageType(other.as_str().to_string())),
        }
    }

    fn concatenate(state: &ReassemblyState) -> Bytes {
        let size = state.fragments.values().map(|f| f.len()).sum();
        let mut data = BytesMut::with_capacity(size);
        for fragment in state.fragments.values() {
            data.extend_from_slice(fragment);
        }
        data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::TextSerializer;

    fn upload_context(deadline: u64) -> Arc<UploadContext<String>> {
        Arc::new(UploadContext::new(
            "c2".to_string(),
            Destination::temporary(),
            Destination::new("replies"),
            deadline,
            ProtocolVersion::V1,
            Arc::new(TextSerializer),
            Arc::new(ServerMetrics::new()),
            CancellationToken::new(),
        ))
    }

    fn fragment(index: u32, total: u32, payload: &str) -> Message {
        Message::new(MessageType::ChannelUpload, ProtocolVersion::V1)
            .with_call_id("c2")
            .with_fragment(index, total)
            .with_payload(payload.as_bytes().to_vec())
    }

    #[test]
    fn test_reassembly_in_order() {
        let ctx = upload_context(now_millis() + 10_000);

        assert!(ctx.on_upload_message(fragment(0, 3, "big")).unwrap().is_none());
        assert!(ctx.on_upload_message(fragment(1, 3, "-req")).unwrap().is_none());
        let data = ctx.on_upload_message(fragment(2, 3, "uest")).unwrap();
        assert_eq!(data.unwrap().as_ref(), b"big-request");
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let ctx = upload_context(now_millis() + 10_000);

        assert!(ctx.on_upload_message(fragment(2, 3, "uest")).unwrap().is_none());
        assert!(ctx.on_upload_message(fragment(0, 3, "big")).unwrap().is_none());
        // duplicate delivery of an already stored fragment
        assert!(ctx.on_upload_message(fragment(0, 3, "big")).unwrap().is_none());
        let data = ctx.on_upload_message(fragment(1, 3, "-req")).unwrap();
        assert_eq!(data.unwrap().as_ref(), b"big-request");
    }

    #[test]
    fn test_channel_end_completes_without_total() {
        let ctx = upload_context(now_millis() + 10_000);

        let without_total = Message::new(MessageType::ChannelUpload, ProtocolVersion::V1)
            .with_call_id("c2")
            .with_header(
                courier_datapath::messages::HDR_FRAGMENT_INDEX,
                0,
            )
            .with_payload("whole".as_bytes().to_vec());
        assert!(ctx.on_upload_message(without_total).unwrap().is_none());

        let end = Message::new(MessageType::ChannelEnd, ProtocolVersion::V1).with_call_id("c2");
        let data = ctx.on_upload_message(end).unwrap();
        assert_eq!(data.unwrap().as_ref(), b"whole");
    }

    #[test]
    fn test_unexpected_type_rejected() {
        let ctx = upload_context(now_millis() + 10_000);
        let signal = Message::new(MessageType::Signal, ProtocolVersion::V1).with_call_id("c2");
        assert!(matches!(
            ctx.on_upload_message(signal),
            Err(ProxyError::UnexpectedMessageType(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_reports_completion() {
        let ctx = upload_context(now_millis() + 10_000);
        let (broker_tx, broker_rx) = mpsc::channel(16);
        let (completed_tx, mut completed_rx) = mpsc::channel(16);

        ctx.spawn_listener(broker_rx, completed_tx);

        broker_tx.send(Ok(fragment(0, 2, "pay"))).await.unwrap();
        broker_tx.send(Ok(fragment(1, 2, "load"))).await.unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(1), completed_rx.recv())
            .await
            .expect("timed out")
            .expect("listener dropped completion channel");
        assert_eq!(completed.call_id, "c2");
        assert_eq!(completed.data.as_ref(), b"payload");
        assert!(ctx.is_closed());
    }

    #[tokio::test]
    async fn test_listener_deadline() {
        let ctx = upload_context(now_millis() + 50);
        let (_broker_tx, broker_rx) = mpsc::channel::<Result<Message, _>>(16);
        let (completed_tx, mut completed_rx) = mpsc::channel(16);

        ctx.spawn_listener(broker_rx, completed_tx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ctx.is_closed());
        assert!(completed_rx.try_recv().is_err());
    }
}
