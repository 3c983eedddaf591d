use super::*;
use crate::auth::TokenAuthentication;
use crate::http::{read_request, write_request, Body, ParseLimits};
use std::sync::Mutex;

#[derive(Default)]
struct RecordingRoutes {
    registered: Mutex<Vec<(Handler, RequestFlags)>>,
}

impl RouteRegistry for RecordingRoutes {
    fn register(&self, handler: Handler, extra_flags: RequestFlags) -> String {
        let mut registered = self.registered.lock().expect("routes lock");
        registered.push((handler, extra_flags));
        format!("/redirected/{}", registered.len())
    }
}

fn context(routes: Arc<RecordingRoutes>) -> HandlerContext {
    HandlerContext {
        connection_id: 1,
        remote_addr: None,
        cancel: CancellationToken::new(),
        client_abort: CancellationToken::new(),
        routes,
    }
}

/// Configures a request, answers it, and judges the answer, as one exchange would.
async fn round_trip(handler: &Handler) -> (HttpResponse, bool) {
    let mut request = HttpRequest::get("/test");
    handler.configure_request(&mut request).expect("configure");
    let mut wire = Vec::new();
    write_request(&mut wire, &request).await.expect("write");
    let mut reader: &[u8] = &wire;
    let request = read_request(&mut reader, &ParseLimits::default())
        .await
        .expect("parse")
        .expect("request");
    let ctx = context(Arc::new(RecordingRoutes::default()));
    let response = handler
        .handle_request(&ctx, &request, handler.flags())
        .await
        .expect("handle");
    let accepted = handler.check_response(&response);
    (response, accepted)
}

#[tokio::test]
async fn built_in_handlers_accept_their_own_requests() {
    let handlers = vec![
        Handler::hello("hello"),
        Handler::get("get", 204),
        Handler::get_with_body("get-body", 200, "payload").expect("body status"),
        Handler::post("post", Some("hello".to_string()), TransferMode::Default),
        Handler::post("post-empty", None, TransferMode::Default),
        Handler::post("post-length", Some("abc".to_string()), TransferMode::ContentLength)
            .with_flags(RequestFlags::EXPLICITLY_SET_LENGTH),
        Handler::post("post-chunked", Some("chunks".to_string()), TransferMode::Chunked),
        Handler::put("put", Some("put body".to_string()), TransferMode::Default),
        Handler::post("post-no-length", None, TransferMode::Default)
            .with_flags(RequestFlags::NO_CONTENT_LENGTH | RequestFlags::NO_BODY),
        Handler::delete("delete", None).with_flags(RequestFlags::NO_BODY),
        Handler::delete("delete-body", Some("gone".to_string())),
        Handler::delay(Duration::from_millis(5), Handler::hello("delayed")),
    ];
    for handler in handlers {
        let (response, accepted) = round_trip(&handler).await;
        assert!(
            accepted,
            "{} rejected its own response: {} {}",
            handler.identifier(),
            response.status(),
            response.body().text()
        );
    }
}

#[tokio::test]
async fn assertion_failure_becomes_500() {
    let handler = Handler::post("post", Some("expected".to_string()), TransferMode::Default);
    let mut request = HttpRequest::new("POST", "/test");
    request.headers.set("Content-Length", "5");
    request.body = Body::Fixed(b"wrong".to_vec());
    let ctx = context(Arc::new(RecordingRoutes::default()));
    let response = handler
        .handle_request(&ctx, &request, handler.flags())
        .await
        .expect("converted");
    assert_eq!(response.status(), 500);
    assert!(response.body().text().contains("body mismatch"));
    assert!(!handler.check_response(&response));
}

#[tokio::test]
async fn cancellation_wins_over_assertion() {
    let handler = Handler::hello("hello");
    let request = HttpRequest::new("DELETE", "/test");
    let ctx = context(Arc::new(RecordingRoutes::default()));
    ctx.cancel.cancel();
    let err = handler
        .handle_request(&ctx, &request, handler.flags())
        .await
        .unwrap_err();
    assert!(err.is_cancellation());
}

#[tokio::test]
async fn connection_flags_are_applied_after_the_handler() {
    let ctx = context(Arc::new(RecordingRoutes::default()));
    let request = HttpRequest::get("/");

    let keep = Handler::hello("keep").with_flags(RequestFlags::KEEP_ALIVE);
    let mut response = keep
        .handle_request(&ctx, &request, keep.flags())
        .await
        .expect("handle");
    assert_eq!(response.keep_alive(), Some(true));
    response.resolve_headers();
    assert!(response.allows_reuse());

    let close = Handler::hello("close").with_flags(RequestFlags::KEEP_ALIVE | RequestFlags::CLOSE_CONNECTION);
    let mut response = close
        .handle_request(&ctx, &request, close.flags())
        .await
        .expect("handle");
    response.resolve_headers();
    assert!(!response.allows_reuse());
}

#[tokio::test]
async fn redirect_registers_target_with_redirect_flags() {
    let routes = Arc::new(RecordingRoutes::default());
    let ctx = context(routes.clone());
    let handler = Handler::redirect(
        302,
        Handler::post("target", Some("data".to_string()), TransferMode::Default),
    );
    let mut request = HttpRequest::get("/");
    handler.configure_request(&mut request).expect("configure");
    assert_eq!(request.method, "POST");

    let response = handler
        .handle_request(&ctx, &request, handler.flags())
        .await
        .expect("handle");
    assert_eq!(response.status(), 302);
    assert_eq!(response.headers().get("Location"), Some("/redirected/1"));

    let registered = routes.registered.lock().expect("routes lock");
    let (target, flags) = &registered[0];
    assert_eq!(target.identifier(), "target");
    assert!(flags.contains(RequestFlags::REDIRECTED | RequestFlags::REDIRECTED_AS_GET));
    assert!(!target.is_dispatched());
}

#[tokio::test]
async fn redirected_post_must_arrive_as_get() {
    let handler = Handler::post("target", Some("data".to_string()), TransferMode::Default);
    let ctx = context(Arc::new(RecordingRoutes::default()));
    let flags = RequestFlags::REDIRECTED | RequestFlags::REDIRECTED_AS_GET;

    let response = handler
        .handle_request(&ctx, &HttpRequest::get("/r"), flags)
        .await
        .expect("handle");
    assert_eq!(response.status(), 200);

    let mut still_post = HttpRequest::new("POST", "/r");
    still_post.body = Body::Fixed(b"data".to_vec());
    let response = handler
        .handle_request(&ctx, &still_post, flags)
        .await
        .expect("handle");
    assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn auth_challenges_then_delegates() {
    let middleware = Arc::new(TokenAuthentication::new("Token", "s3cret"));
    let handler = Handler::auth(middleware, Handler::hello("protected"));
    let ctx = context(Arc::new(RecordingRoutes::default()));

    let mut request = HttpRequest::get("/");
    handler.configure_request(&mut request).expect("configure");
    assert!(request.credentials.is_some());

    let challenge = handler
        .handle_request(&ctx, &request, handler.flags())
        .await
        .expect("handle");
    assert_eq!(challenge.status(), 401);
    assert_eq!(challenge.keep_alive(), Some(true));

    request.headers.set(
        "Authorization",
        TokenAuthentication::authorization_value("Token", "s3cret"),
    );
    let response = handler
        .handle_request(&ctx, &request, handler.flags())
        .await
        .expect("handle");
    assert!(handler.check_response(&response));
}

#[tokio::test]
async fn abort_decorator_cancels_the_client() {
    let handler = Handler::abort(Handler::hello("hello"));
    let ctx = context(Arc::new(RecordingRoutes::default()));
    let response = handler
        .handle_request(&ctx, &HttpRequest::get("/"), handler.flags())
        .await
        .expect("handle");
    assert!(ctx.client_abort.is_cancelled());
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn delay_is_cancellable() {
    let handler = Handler::delay(Duration::from_secs(30), Handler::hello("slow"));
    let ctx = context(Arc::new(RecordingRoutes::default()));
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    });
    let err = handler
        .handle_request(&ctx, &HttpRequest::get("/"), handler.flags())
        .await
        .unwrap_err();
    assert!(err.is_cancellation());
}

#[test]
fn dispatched_handler_refuses_changes_but_clones_do_not() {
    let mut handler = Handler::hello("hello");
    handler.set_flags(RequestFlags::KEEP_ALIVE).expect("fresh handler");
    handler.mark_dispatched();
    assert!(matches!(
        handler.set_flags(RequestFlags::NONE),
        Err(HarnessError::Contract(_))
    ));

    let mut copy = handler.clone();
    assert!(!copy.is_dispatched());
    copy.set_identifier("copy").expect("clone is mutable");
    assert_eq!(copy.flags(), RequestFlags::KEEP_ALIVE);
}

#[test]
fn explicit_length_requires_content_length_mode() {
    let handler = Handler::post("post", Some("x".to_string()), TransferMode::Chunked)
        .with_flags(RequestFlags::EXPLICITLY_SET_LENGTH);
    let mut request = HttpRequest::get("/");
    assert!(matches!(
        handler.configure_request(&mut request),
        Err(HarnessError::Contract(_))
    ));
}

#[test]
fn only_see_other_turns_every_method_into_get() {
    assert!(redirects_as_get(303, "PUT"));
    assert!(!redirects_as_get(303, "HEAD"));
    assert!(redirects_as_get(302, "POST"));
    assert!(!redirects_as_get(302, "PUT"));
    assert!(!redirects_as_get(307, "POST"));
}

#[test]
fn get_with_body_rejects_bodiless_statuses() {
    for status in [101, 204, 304] {
        let err = Handler::get_with_body("no-body", status, "payload").expect_err("bodiless");
        assert!(matches!(err, HarnessError::Contract(_)), "{status}: {err}");
    }
    assert!(Handler::get_with_body("body", 404, "missing").is_ok());
}
