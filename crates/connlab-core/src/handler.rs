//! Composable request handlers.
//!
//! A handler is either a leaf that answers a request itself or a decorator
//! wrapping another handler. Every handler can prepare the client's request,
//! answer it on the server, and judge the response the client finally got.

mod decorator;
mod leaf;

#[cfg(test)]
mod tests;

pub use decorator::{redirects_as_get, Decorator};
pub use leaf::{Leaf, TransferMode, HELLO_WORLD};

use crate::auth::AuthenticationMiddleware;
use crate::error::{HarnessError, Result};
use crate::flags::RequestFlags;
use crate::http::{is_bodiless_status, HttpRequest, HttpResponse};
use futures::future::{BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lets a handler publish further handlers on the server.
pub trait RouteRegistry: Send + Sync {
    /// Registers `handler` with `extra_flags` and returns its request path.
    fn register(&self, handler: Handler, extra_flags: RequestFlags) -> String;
}

/// Server-side view of the exchange a handler is answering.
pub struct HandlerContext {
    pub connection_id: u64,
    pub remote_addr: Option<SocketAddr>,
    /// Cancelled when the exchange is torn down.
    pub cancel: CancellationToken,
    /// Cancelling this aborts the client operation that sent the request.
    pub client_abort: CancellationToken,
    pub routes: Arc<dyn RouteRegistry>,
}

#[derive(Debug, Clone)]
pub enum HandlerKind {
    Leaf(Leaf),
    Decorator(Decorator, Box<Handler>),
}

#[derive(Debug)]
pub struct Handler {
    identifier: String,
    flags: RequestFlags,
    kind: HandlerKind,
    dispatched: AtomicBool,
}

impl Clone for Handler {
    fn clone(&self) -> Self {
        Self {
            identifier: self.identifier.clone(),
            flags: self.flags,
            kind: self.kind.clone(),
            dispatched: AtomicBool::new(false),
        }
    }
}

impl Handler {
    fn new(identifier: impl Into<String>, kind: HandlerKind) -> Self {
        Self {
            identifier: identifier.into(),
            flags: RequestFlags::NONE,
            kind,
            dispatched: AtomicBool::new(false),
        }
    }

    pub fn hello(identifier: impl Into<String>) -> Self {
        Self::new(identifier, HandlerKind::Leaf(Leaf::Hello))
    }

    pub fn get(identifier: impl Into<String>, status: u16) -> Self {
        Self::new(identifier, HandlerKind::Leaf(Leaf::Get { status, body: None }))
    }

    /// Fails for statuses whose responses never carry a body (1xx, 204, 304).
    pub fn get_with_body(
        identifier: impl Into<String>,
        status: u16,
        body: impl Into<String>,
    ) -> Result<Self> {
        if is_bodiless_status(status) {
            return Err(HarnessError::contract(format!(
                "status {} cannot carry a response body",
                status
            )));
        }
        Ok(Self::new(
            identifier,
            HandlerKind::Leaf(Leaf::Get {
                status,
                body: Some(body.into()),
            }),
        ))
    }

    pub fn post(identifier: impl Into<String>, content: Option<String>, mode: TransferMode) -> Self {
        Self::new(
            identifier,
            HandlerKind::Leaf(Leaf::Post {
                content,
                mode,
                method: None,
            }),
        )
    }

    pub fn put(identifier: impl Into<String>, content: Option<String>, mode: TransferMode) -> Self {
        Self::new(
            identifier,
            HandlerKind::Leaf(Leaf::Post {
                content,
                mode,
                method: Some("PUT".to_string()),
            }),
        )
    }

    pub fn delete(identifier: impl Into<String>, body: Option<String>) -> Self {
        Self::new(identifier, HandlerKind::Leaf(Leaf::Delete { body }))
    }

    pub fn redirect(status: u16, target: Handler) -> Self {
        let identifier = format!("Redirect({})", target.identifier);
        Self::new(
            identifier,
            HandlerKind::Decorator(Decorator::Redirect { status }, Box::new(target)),
        )
    }

    pub fn auth(middleware: Arc<dyn AuthenticationMiddleware>, target: Handler) -> Self {
        let identifier = format!("Auth({})", target.identifier);
        Self::new(
            identifier,
            HandlerKind::Decorator(Decorator::Auth(middleware), Box::new(target)),
        )
    }

    pub fn delay(delay: Duration, target: Handler) -> Self {
        let identifier = format!("Delay({})", target.identifier);
        Self::new(
            identifier,
            HandlerKind::Decorator(Decorator::Delay(delay), Box::new(target)),
        )
    }

    pub fn abort(target: Handler) -> Self {
        let identifier = format!("Abort({})", target.identifier);
        Self::new(
            identifier,
            HandlerKind::Decorator(Decorator::Abort, Box::new(target)),
        )
    }

    #[must_use]
    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }

    pub fn target(&self) -> Option<&Handler> {
        match &self.kind {
            HandlerKind::Leaf(_) => None,
            HandlerKind::Decorator(_, target) => Some(target),
        }
    }

    /// Marks the handler as in use; later mutation is refused.
    pub fn mark_dispatched(&self) {
        self.dispatched.store(true, Ordering::Release);
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    fn want_to_modify(&self) -> Result<()> {
        if self.is_dispatched() {
            return Err(HarnessError::contract(format!(
                "handler {} cannot be modified after a request was dispatched through it",
                self.identifier
            )));
        }
        Ok(())
    }

    pub fn set_flags(&mut self, flags: RequestFlags) -> Result<()> {
        self.want_to_modify()?;
        self.flags = flags;
        Ok(())
    }

    pub fn set_identifier(&mut self, identifier: impl Into<String>) -> Result<()> {
        self.want_to_modify()?;
        self.identifier = identifier.into();
        Ok(())
    }

    /// Prepares an outgoing request so that this handler will accept it.
    pub fn configure_request(&self, request: &mut HttpRequest) -> Result<()> {
        if self.flags.contains(RequestFlags::KEEP_ALIVE) {
            request.headers.set("Connection", "keep-alive");
        }
        match &self.kind {
            HandlerKind::Leaf(leaf) => leaf.configure_request(self.flags, request),
            HandlerKind::Decorator(decorator, target) => {
                decorator.configure_request(request);
                target.configure_request(request)
            }
        }
    }

    /// Answers `request` on the server.
    ///
    /// Assertion failures inside the handler become a 500 response unless
    /// the exchange is being cancelled, in which case cancellation wins.
    pub fn handle_request<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        request: &'a HttpRequest,
        effective_flags: RequestFlags,
    ) -> BoxFuture<'a, Result<HttpResponse>> {
        async move {
            let result = match &self.kind {
                HandlerKind::Leaf(leaf) => leaf.handle_request(request, effective_flags),
                HandlerKind::Decorator(decorator, target) => {
                    decorator
                        .handle_request(target, ctx, request, effective_flags)
                        .await
                }
            };
            let mut response = match result {
                Ok(response) => response,
                Err(_) if ctx.cancel.is_cancelled() => return Err(HarnessError::Canceled),
                Err(HarnessError::Assertion(message)) => {
                    tracing::debug!("handler {} failed: {}", self.identifier, message);
                    HttpResponse::error(500, message)
                }
                Err(err) => return Err(err),
            };
            if effective_flags.contains(RequestFlags::CLOSE_CONNECTION) {
                response.set_close_connection(true)?;
            }
            if effective_flags.contains(RequestFlags::KEEP_ALIVE) && response.keep_alive().is_none()
            {
                response.set_keep_alive(true)?;
            }
            Ok(response)
        }
        .boxed()
    }

    /// Judges the response the client finally received.
    pub fn check_response(&self, response: &HttpResponse) -> bool {
        match &self.kind {
            HandlerKind::Leaf(leaf) => leaf.check_response(response),
            HandlerKind::Decorator(_, target) => target.check_response(response),
        }
    }
}
