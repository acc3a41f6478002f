use std::any::Any;
use std::sync::Arc;

use crate::http1::{RequestHead, ResponseHead};
use crate::websocket::WsSession;

/// Per-request context handed to every handler.
///
/// One instance spans the whole request lifecycle; for a bridged WebSocket
/// connection that includes both relay directions, so handlers on opposite
/// directions see each other's `user_data`.
pub struct ProxyCtx {
    pub request: RequestHead,
    pub response: Option<ResponseHead>,
    pub ws_session: Option<Arc<WsSession>>,
    /// Scratch space for handler chains that need to carry state between
    /// phases or frames.
    pub user_data: Option<Box<dyn Any + Send>>,
}

impl ProxyCtx {
    pub(crate) fn new(request: RequestHead) -> Self {
        Self {
            request,
            response: None,
            ws_session: None,
            user_data: None,
        }
    }
}
