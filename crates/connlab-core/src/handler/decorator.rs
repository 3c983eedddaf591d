use super::{Handler, HandlerContext};
use crate::auth::{AuthenticationMiddleware, AuthenticationState};
use crate::error::{HarnessError, Result};
use crate::flags::RequestFlags;
use crate::http::{HttpRequest, HttpResponse};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Decorator {
    /// Publishes the target on a fresh path and redirects there.
    Redirect { status: u16 },
    Auth(Arc<dyn AuthenticationMiddleware>),
    Delay(Duration),
    /// Aborts the client's request, then lets the target answer anyway.
    Abort,
}

impl Decorator {
    pub(super) fn configure_request(&self, request: &mut HttpRequest) {
        if let Decorator::Auth(middleware) = self {
            middleware.configure_request(request);
        }
    }

    pub(super) async fn handle_request(
        &self,
        target: &Handler,
        ctx: &HandlerContext,
        request: &HttpRequest,
        effective_flags: RequestFlags,
    ) -> Result<HttpResponse> {
        match self {
            Decorator::Redirect { status } => {
                let mut extra = RequestFlags::REDIRECTED;
                if redirects_as_get(*status, &request.method) {
                    extra |= RequestFlags::REDIRECTED_AS_GET;
                }
                let location = ctx.routes.register(target.clone(), extra);
                tracing::debug!(
                    "connection {}: redirecting {} to {} ({})",
                    ctx.connection_id,
                    request.path,
                    location,
                    status
                );
                Ok(HttpResponse::redirect(*status, location))
            }
            Decorator::Auth(middleware) => {
                let (response, state) = middleware.handle_authentication(ctx.connection_id, request);
                tracing::debug!(
                    "connection {}: authentication state {:?}",
                    ctx.connection_id,
                    state
                );
                if let Some(mut response) = response {
                    // The answer to a challenge has to be able to reuse this connection.
                    if state == AuthenticationState::Challenge {
                        response.set_keep_alive(true)?;
                    }
                    return Ok(response);
                }
                let flags = effective_flags | target.flags() | RequestFlags::REDIRECTED;
                target.handle_request(ctx, request, flags).await
            }
            Decorator::Delay(delay) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(HarnessError::Canceled),
                    _ = tokio::time::sleep(*delay) => {
                        target
                            .handle_request(ctx, request, effective_flags | target.flags())
                            .await
                    }
                }
            }
            Decorator::Abort => {
                tracing::debug!("connection {}: aborting client request", ctx.connection_id);
                ctx.client_abort.cancel();
                target
                    .handle_request(ctx, request, effective_flags | target.flags())
                    .await
            }
        }
    }
}

/// Whether a client follows a `status` redirect of `method` with a GET.
pub fn redirects_as_get(status: u16, method: &str) -> bool {
    match status {
        303 => !method.eq_ignore_ascii_case("HEAD"),
        301 | 302 => method.eq_ignore_ascii_case("POST"),
        _ => false,
    }
}
