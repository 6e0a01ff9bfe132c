// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

// Standard library imports
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

// Third-party crates
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

// Local crate
use courier_datapath::broker::{BrokerConnection, BrokerProducer, InboundReceiver};
use courier_datapath::messages::{
    now_millis, Destination, Message, MessageType, ProtocolVersion, HDR_MAX_FRAGMENT_SIZE,
    HDR_MESSAGE_TYPE,
};

use crate::call_table::CallTable;
use crate::config::ProxyConfig;
use crate::context::ServerContext;
use crate::errors::ProxyError;
use crate::handler::RequestHandler;
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::response::ResponseContext;
use crate::serializer::{MessageSerializer, SerializerRegistry};
use crate::upload::{CompletedUpload, UploadContext};

// capacity of the upload-completion channel between listener tasks and the
// proxy event loop
const COMPLETION_CHANNEL_SIZE: usize = 128;

/// Notified once the proxy is subscribed and accepting calls.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self);
}

/// Notified exactly once after the proxy finished stopping.
pub trait CloseListener: Send + Sync {
    fn closed(&self);
}

/// The server side of the request/response fabric.
///
/// Subscribes to one broker destination, demultiplexes inbound messages
/// into per-call contexts, bounds handler concurrency with a counting
/// permit acquired on the delivery path (so unconsumed load queues in the
/// broker, not in process memory), coordinates fragmented uploads over
/// private reply channels, and streams handler responses back.
pub struct RequestProxy<M> {
    inner: Arc<ProxyInner<M>>,
}

impl<M> std::fmt::Debug for RequestProxy<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestProxy").finish_non_exhaustive()
    }
}

impl<M> Clone for RequestProxy<M> {
    fn clone(&self) -> Self {
        RequestProxy {
            inner: self.inner.clone(),
        }
    }
}

impl<M> RequestProxy<M>
where
    M: Send + 'static,
{
    pub fn builder() -> RequestProxyBuilder<M> {
        RequestProxyBuilder::new()
    }

    /// Open the shared reply producer, subscribe on the configured
    /// destination, and start dispatching. Connection listeners fire once
    /// the consumer is attached.
    pub async fn start(&self) -> Result<(), ProxyError> {
        ProxyInner::start(&self.inner).await
    }

    /// Detach the consumer, wait up to the configured grace period for
    /// in-flight calls, then release resources. Idempotent; close
    /// listeners fire exactly once.
    pub async fn stop(&self) {
        self.inner.stop().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        let mut listeners = self.inner.connection_listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.inner
            .connection_listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_close_listener(&self, listener: Arc<dyn CloseListener>) {
        let mut listeners = self.inner.close_listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_close_listener(&self, listener: &Arc<dyn CloseListener>) {
        self.inner
            .close_listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }
}

struct ProxyInner<M> {
    config: ProxyConfig,
    broker: Arc<dyn BrokerConnection>,
    handler: Arc<dyn RequestHandler<M>>,
    serializers: SerializerRegistry<M>,

    /// Per-call server contexts, keyed by correlation identifier.
    calls: CallTable<M>,
    metrics: Arc<ServerMetrics>,

    /// The sole gate on in-flight concurrency.
    semaphore: Arc<Semaphore>,
    /// Worker tasks, awaited by the shutdown barrier.
    tracker: TaskTracker,
    cancellation_token: CancellationToken,

    producer: OnceLock<Arc<dyn BrokerProducer>>,
    completed_tx: mpsc::Sender<CompletedUpload<M>>,
    completed_rx: Mutex<Option<mpsc::Receiver<CompletedUpload<M>>>>,

    connection_listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    close_listeners: Mutex<Vec<Arc<dyn CloseListener>>>,

    started: AtomicBool,
    stopped: AtomicBool,
}

impl<M> ProxyInner<M>
where
    M: Send + 'static,
{
    async fn start(inner: &Arc<Self>) -> Result<(), ProxyError> {
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyStarted);
        }

        let producer = inner.broker.create_producer().await?;
        let _ = inner.producer.set(producer);

        let destination = Destination::new(&inner.config.destination_name);
        let rx = inner.broker.subscribe(&destination).await?;

        info!(
            %destination,
            max_concurrent_calls = inner.config.max_concurrent_calls,
            "request proxy started",
        );

        Self::spawn_consumer_loop(inner.clone(), rx);
        if let Some(completed_rx) = inner.completed_rx.lock().take() {
            Self::spawn_completion_loop(inner.clone(), completed_rx);
        }

        let listeners = inner.connection_listeners.lock().clone();
        for listener in listeners {
            listener.connected();
        }

        Ok(())
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping request proxy");

        // stop accepting messages and cancel upload listeners
        self.cancellation_token.cancel();
        // wake admissions parked on the permit; they drop their messages
        self.semaphore.close();

        // wait for ongoing calls to finish
        self.tracker.close();
        let timeout = self.config.shutdown_timeout();
        if time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                timeout_ms = self.config.shutdown_timeout_ms,
                "in-flight calls did not finish in time, abandoning",
            );
        }

        let listeners = self.close_listeners.lock().clone();
        for listener in listeners {
            listener.closed();
        }

        info!("request proxy stopped");
    }

    fn spawn_consumer_loop(inner: Arc<Self>, mut rx: InboundReceiver) {
        tokio::spawn(async move {
            debug!("starting consumer loop");
            loop {
                tokio::select! {
                    _ = inner.cancellation_token.cancelled() => {
                        debug!("consumer detached");
                        break;
                    }
                    next = rx.recv() => match next {
                        None => {
                            info!("consumer channel closed");
                            break;
                        }
                        Some(Ok(msg)) => Self::on_message(&inner, msg).await,
                        Some(Err(e)) => {
                            error!(error = %e, "fatal broker error, stopping proxy");
                            inner.metrics.error();
                            // stop must not run on the broker delivery path
                            let inner = inner.clone();
                            tokio::spawn(async move { inner.stop().await });
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_completion_loop(inner: Arc<Self>, mut rx: mpsc::Receiver<CompletedUpload<M>>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancellation_token.cancelled() => break,
                    next = rx.recv() => match next {
                        None => break,
                        Some(completed) => {
                            if let Err(e) = Self::on_upload_completed(&inner, completed).await {
                                inner.metrics.error();
                                error!(error = %e, "error dispatching completed upload");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Inbound entry point, one invocation per broker message, running on
    /// the consumer loop. Blocking here is deliberate: it is what pushes
    /// load back into the broker.
    async fn on_message(inner: &Arc<Self>, msg: Message) {
        inner.calls.maybe_sweep();
        inner.metrics.request();

        let version = match msg
            .protocol_version_tag()
            .ok()
            .and_then(ProtocolVersion::from_tag)
        {
            Some(version) => version,
            None => {
                warn!(call_id = ?msg.call_id(), "ignoring request of incompatible version");
                inner.metrics.incompatible_message();
                return;
            }
        };

        let deadline = match msg.deadline() {
            Ok(deadline) => deadline,
            Err(e) => {
                warn!(call_id = ?msg.call_id(), error = %e, "ignoring request without valid deadline");
                inner.metrics.incompatible_message();
                return;
            }
        };
        if deadline <= now_millis() {
            warn!(call_id = ?msg.call_id(), "ignoring request: timed out");
            inner.metrics.request_timeout();
            return;
        }

        debug!(
            call_id = ?msg.call_id(),
            message_type = ?msg.header(HDR_MESSAGE_TYPE),
            "processing inbound message",
        );

        // permit before submit; when the pool is saturated this suspends
        // the consumer and messages queue up in the broker
        let permit = match inner.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("permit pool closed, dropping message");
                return;
            }
        };

        let worker = inner.clone();
        inner.tracker.spawn(async move {
            let _permit = permit;
            if let Err(e) = Self::process_message(&worker, msg, version, deadline).await {
                worker.metrics.error();
                error!(error = %e, "error handling call");
            }
        });
    }

    async fn process_message(
        inner: &Arc<Self>,
        msg: Message,
        version: ProtocolVersion,
        deadline: u64,
    ) -> Result<(), ProxyError> {
        match msg.message_type() {
            Ok(MessageType::Signal) => inner.handle_signal(msg, version, deadline).await,
            Ok(MessageType::ChannelRequest) => {
                Self::handle_channel_request(inner, msg, version, deadline).await
            }
            Ok(other) => {
                warn!(message_type = %other, "ignoring unrecognized request type");
                inner.metrics.incompatible_message();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "ignoring message without recognizable type");
                inner.metrics.incompatible_message();
                Ok(())
            }
        }
    }

    async fn handle_signal(
        &self,
        msg: Message,
        version: ProtocolVersion,
        deadline: u64,
    ) -> Result<(), ProxyError> {
        // ignore requests without a clear response destination/call id
        let (call_id, reply_to) = match (msg.call_id(), msg.reply_to()) {
            (Some(call_id), Some(reply_to)) => (call_id.to_string(), reply_to.clone()),
            _ => {
                debug!("request without return information ignored");
                return Ok(());
            }
        };
        debug!(%call_id, "handling signal");

        let serializer = match self.resolve_serializer(&msg) {
            Some(serializer) => serializer,
            None => return Ok(()),
        };

        let ctx = match self.calls.get(&call_id) {
            Some(ServerContext::Response(ctx)) => ctx,
            // a plain signal while an upload channel is open for the same
            // call id violates the protocol; drop the message
            Some(ServerContext::Upload(_)) => {
                return Err(ProxyError::UploadInProgress(call_id))
            }
            None => {
                let ctx = Arc::new(ResponseContext::new(
                    call_id.clone(),
                    reply_to,
                    deadline,
                    version,
                    serializer.clone(),
                    self.config.max_message_size,
                    self.config.priority,
                    self.producer()?,
                    self.metrics.clone(),
                ));
                self.calls
                    .insert(call_id.clone(), ServerContext::Response(ctx.clone()));
                ctx
            }
        };

        let request = serializer.deserialize(msg.payload())?;
        self.invoke_handler(request, ctx).await
    }

    async fn handle_channel_request(
        inner: &Arc<Self>,
        msg: Message,
        version: ProtocolVersion,
        deadline: u64,
    ) -> Result<(), ProxyError> {
        let (call_id, reply_to) = match (msg.call_id(), msg.reply_to()) {
            (Some(call_id), Some(reply_to)) => (call_id.to_string(), reply_to.clone()),
            _ => {
                info!("channel request without return information ignored");
                inner.metrics.incompatible_message();
                return Ok(());
            }
        };
        debug!(%call_id, "handling channel request");

        let serializer = match inner.resolve_serializer(&msg) {
            Some(serializer) => serializer,
            None => return Ok(()),
        };

        // a second channel-request for the same call is a client retry
        if inner.calls.get(&call_id).is_some() {
            debug!(%call_id, "channel already set up");
            return Ok(());
        }

        inner.metrics.fragmented_upload_requested();

        let upload_destination = inner.broker.create_temporary_destination().await?;
        let upload_rx = inner.broker.subscribe(&upload_destination).await?;

        let ctx = Arc::new(UploadContext::new(
            call_id.clone(),
            upload_destination.clone(),
            reply_to.clone(),
            deadline,
            version,
            serializer,
            inner.metrics.clone(),
            inner.cancellation_token.child_token(),
        ));
        inner
            .calls
            .insert(call_id.clone(), ServerContext::Upload(ctx.clone()));
        ctx.spawn_listener(upload_rx, inner.completed_tx.clone());

        // advertise the private destination and the fragment cap
        let setup = Message::new(MessageType::ChannelSetup, version)
            .with_call_id(&call_id)
            .with_reply_to(upload_destination)
            .with_deadline(deadline)
            .with_header(HDR_MAX_FRAGMENT_SIZE, inner.config.max_message_size);
        inner
            .producer()?
            .send(&reply_to, setup, inner.config.priority)
            .await?;

        Ok(())
    }

    /// Promote a completed upload to a response context and hand the
    /// request to the downstream handler.
    async fn on_upload_completed(
        inner: &Arc<Self>,
        completed: CompletedUpload<M>,
    ) -> Result<(), ProxyError> {
        let CompletedUpload {
            call_id,
            data,
            reply_to,
            deadline,
            protocol_version,
            serializer,
        } = completed;
        debug!(%call_id, bytes = data.len(), "channel upload completed");

        let ctx = Arc::new(ResponseContext::new(
            call_id.clone(),
            reply_to,
            deadline,
            protocol_version,
            serializer.clone(),
            inner.config.max_message_size,
            inner.config.priority,
            inner.producer()?,
            inner.metrics.clone(),
        ));
        // atomic promotion: overwrite the upload entry with the response
        // context
        inner
            .calls
            .insert(call_id.clone(), ServerContext::Response(ctx.clone()));
        inner.metrics.fragmented_upload_completed();

        let request = serializer.deserialize(&data)?;

        // handler invocations stay bounded by the permit pool on this path
        // as well
        let permit = match inner.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!(%call_id, "permit pool closed, dropping completed upload");
                return Ok(());
            }
        };

        let worker = inner.clone();
        inner.tracker.spawn(async move {
            let _permit = permit;
            if let Err(e) = worker.invoke_handler(request, ctx).await {
                worker.metrics.error();
                error!(error = %e, "error handling call");
            }
        });

        Ok(())
    }

    async fn invoke_handler(
        &self,
        request: M,
        ctx: Arc<ResponseContext<M>>,
    ) -> Result<(), ProxyError> {
        if let Err(e) = self.handler.handle(request, ctx.clone()).await {
            warn!(call_id = %ctx.call_id(), error = %e, "handler failed");
            // report_error counts the failure and closes the call; a send
            // failure on the error reply is already counted by the context
            if let Err(report_err) = ctx.report_error("handler", &e.to_string()).await {
                warn!(call_id = %ctx.call_id(), error = %report_err, "could not send error reply");
            }
        }
        Ok(())
    }

    fn resolve_serializer(&self, msg: &Message) -> Option<Arc<dyn MessageSerializer<M>>> {
        match msg.serializer_id() {
            Ok(id) => match self.serializers.resolve(id) {
                Some(serializer) => Some(serializer),
                None => {
                    warn!(serializer_id = %id, "unknown serializer");
                    self.metrics.incompatible_message();
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "missing serializer id");
                self.metrics.incompatible_message();
                None
            }
        }
    }

    fn producer(&self) -> Result<Arc<dyn BrokerProducer>, ProxyError> {
        self.producer.get().cloned().ok_or(ProxyError::NotStarted)
    }
}

/// Builder for [`RequestProxy`].
pub struct RequestProxyBuilder<M> {
    config: Option<ProxyConfig>,
    broker: Option<Arc<dyn BrokerConnection>>,
    handler: Option<Arc<dyn RequestHandler<M>>>,
    serializers: SerializerRegistry<M>,
}

impl<M> Default for RequestProxyBuilder<M> {
    fn default() -> Self {
        RequestProxyBuilder {
            config: None,
            broker: None,
            handler: None,
            serializers: SerializerRegistry::new(),
        }
    }
}

impl<M> RequestProxyBuilder<M>
where
    M: Send + 'static,
{
    pub fn new() -> Self {
        RequestProxyBuilder::default()
    }

    pub fn with_config(mut self, config: ProxyConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn BrokerConnection>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler<M>>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn add_serializer(mut self, serializer: Arc<dyn MessageSerializer<M>>) -> Self {
        self.serializers.insert(serializer);
        self
    }

    pub fn build(self) -> Result<RequestProxy<M>, ProxyError> {
        let config = self
            .config
            .ok_or_else(|| ProxyError::Config("configuration not set".to_string()))?;
        config.validate()?;
        let broker = self
            .broker
            .ok_or_else(|| ProxyError::Config("broker connection not set".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| ProxyError::Config("request handler not set".to_string()))?;
        if self.serializers.is_empty() {
            return Err(ProxyError::Config("no serializers provided".to_string()));
        }

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_calls));
        let (completed_tx, completed_rx) = mpsc::channel(COMPLETION_CHANNEL_SIZE);

        Ok(RequestProxy {
            inner: Arc::new(ProxyInner {
                config,
                broker,
                handler,
                serializers: self.serializers,
                calls: CallTable::new(),
                metrics: Arc::new(ServerMetrics::new()),
                semaphore,
                tracker: TaskTracker::new(),
                cancellation_token: CancellationToken::new(),
                producer: OnceLock::new(),
                completed_tx,
                completed_rx: Mutex::new(Some(completed_rx)),
                connection_listeners: Mutex::new(Vec::new()),
                close_listeners: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::TextSerializer;
    use async_trait::async_trait;
    use courier_testing::InMemoryBroker;

    struct NopHandler;

    #[async_trait]
    impl RequestHandler<String> for NopHandler {
        async fn handle(
            &self,
            _request: String,
            responder: Arc<ResponseContext<String>>,
        ) -> Result<(), ProxyError> {
            responder.end_of_stream().await
        }
    }

    #[test]
    fn test_builder_requires_all_parts() {
        let err = RequestProxyBuilder::<String>::new().build().unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));

        let err = RequestProxy::<String>::builder()
            .with_config(ProxyConfig::new("requests"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));

        // broker and handler but no serializer
        let err = RequestProxy::<String>::builder()
            .with_config(ProxyConfig::new("requests"))
            .with_broker(Arc::new(InMemoryBroker::new()))
            .with_handler(Arc::new(NopHandler))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let err = RequestProxy::<String>::builder()
            .with_config(ProxyConfig::new("requests").with_max_concurrent_calls(0))
            .with_broker(Arc::new(InMemoryBroker::new()))
            .with_handler(Arc::new(NopHandler))
            .add_serializer(Arc::new(TextSerializer))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let proxy = RequestProxy::<String>::builder()
            .with_config(ProxyConfig::new("requests"))
            .with_broker(Arc::new(InMemoryBroker::new()))
            .with_handler(Arc::new(NopHandler))
            .add_serializer(Arc::new(TextSerializer))
            .build()
            .unwrap();

        proxy.start().await.unwrap();
        assert!(matches!(
            proxy.start().await.unwrap_err(),
            ProxyError::AlreadyStarted
        ));
        proxy.stop().await;
    }
}
