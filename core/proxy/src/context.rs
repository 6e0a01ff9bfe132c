// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::response::ResponseContext;
use crate::upload::UploadContext;

/// The per-call server state held in the call table: either the reply side
/// of an active call or an upload still being reassembled. Promotion from
/// `Upload` to `Response` replaces the table entry atomically.
pub enum ServerContext<M> {
    Response(Arc<ResponseContext<M>>),
    Upload(Arc<UploadContext<M>>),
}

// manual impl: the contexts are shared, M itself is never cloned
impl<M> Clone for ServerContext<M> {
    fn clone(&self) -> Self {
        match self {
            ServerContext::Response(ctx) => ServerContext::Response(ctx.clone()),
            ServerContext::Upload(ctx) => ServerContext::Upload(ctx.clone()),
        }
    }
}

impl<M> ServerContext<M>
where
    M: Send + 'static,
{
    pub fn is_closed(&self) -> bool {
        match self {
            ServerContext::Response(ctx) => ctx.is_closed(),
            ServerContext::Upload(ctx) => ctx.is_closed(),
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            ServerContext::Response(ctx) => ctx.call_id(),
            ServerContext::Upload(ctx) => ctx.call_id(),
        }
    }
}
