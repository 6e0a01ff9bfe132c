// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Server-side request proxy of the courier messaging library.
//!
//! A [`RequestProxy`] listens on one broker destination, turns each inbound
//! message into a per-call server context, invokes the configured
//! [`RequestHandler`], and streams its responses back to the reply
//! destination the client supplied. Admission is bounded: a counting
//! permit of `max_concurrent_calls` is acquired on the broker delivery
//! path before any work is scheduled, so excess load stays queued in the
//! broker. Large requests are uploaded in fragments over a private reply
//! channel; large responses are fragmented on the way out.

pub mod call_table;
pub mod config;
pub mod context;
pub mod errors;
pub mod handler;
pub mod metrics;
pub mod proxy;
pub mod response;
pub mod serializer;
pub mod upload;

pub use config::ProxyConfig;
pub use errors::ProxyError;
pub use handler::RequestHandler;
pub use metrics::MetricsSnapshot;
pub use proxy::{CloseListener, ConnectionListener, RequestProxy, RequestProxyBuilder};
pub use response::ResponseContext;
pub use serializer::{MessageSerializer, SerializerRegistry, TextSerializer};
