// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::ProxyError;
use crate::response::ResponseContext;

/// The downstream request sink.
///
/// `handle` receives the decoded request and the response context of the
/// call. It must not hold its worker for the duration of a long-lived
/// call: either complete synchronously (writing responses and the
/// end-of-stream through the context) or spawn its own work and return.
/// A returned error closes the call with a terminal error message.
#[async_trait]
pub trait RequestHandler<M>: Send + Sync {
    async fn handle(
        &self,
        request: M,
        responder: Arc<ResponseContext<M>>,
    ) -> Result<(), ProxyError>;
}
