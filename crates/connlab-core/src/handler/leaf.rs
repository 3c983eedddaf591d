use crate::error::{HarnessError, Result};
use crate::flags::RequestFlags;
use crate::http::{Body, HttpRequest, HttpResponse};

pub const HELLO_WORLD: &str = "Hello World";

/// How a posted body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Let the client pick: Content-Length when there is content.
    #[default]
    Default,
    ContentLength,
    Chunked,
}

#[derive(Debug, Clone)]
pub enum Leaf {
    Hello,
    Get {
        status: u16,
        body: Option<String>,
    },
    Post {
        content: Option<String>,
        mode: TransferMode,
        method: Option<String>,
    },
    Delete {
        body: Option<String>,
    },
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(HarnessError::Assertion(message()))
    }
}

fn ensure_no_body(request: &HttpRequest) -> Result<()> {
    ensure(request.body.is_empty(), || {
        format!(
            "{} {} must not carry a body, got {} bytes",
            request.method,
            request.path,
            request.body.bytes().len()
        )
    })
}

impl Leaf {
    pub(super) fn configure_request(&self, flags: RequestFlags, request: &mut HttpRequest) -> Result<()> {
        match self {
            Leaf::Hello | Leaf::Get { .. } => {
                request.method = "GET".to_string();
                request.body = Body::Empty;
            }
            Leaf::Post {
                content,
                mode,
                method,
            } => {
                if flags.contains(RequestFlags::EXPLICITLY_SET_LENGTH)
                    && *mode != TransferMode::ContentLength
                {
                    return Err(HarnessError::contract(
                        "an explicit length requires the content-length transfer mode",
                    ));
                }
                request.method = method.clone().unwrap_or_else(|| "POST".to_string());
                let data = content.as_ref().map(|text| text.as_bytes().to_vec());
                if data.is_some() {
                    request.headers.set("Content-Type", "text/plain");
                }
                request.body = match mode {
                    TransferMode::Chunked => Body::Chunked(data.unwrap_or_default()),
                    TransferMode::ContentLength => {
                        let data = data.unwrap_or_default();
                        request.headers.set("Content-Length", data.len().to_string());
                        Body::Fixed(data)
                    }
                    TransferMode::Default => match data {
                        Some(data) => Body::Fixed(data),
                        None if flags.contains(RequestFlags::NO_CONTENT_LENGTH) => Body::Empty,
                        None => {
                            request.headers.set("Content-Length", "0");
                            Body::Fixed(Vec::new())
                        }
                    },
                };
            }
            Leaf::Delete { body } => {
                request.method = "DELETE".to_string();
                request.body = match body {
                    Some(text) => Body::Fixed(text.as_bytes().to_vec()),
                    None => Body::Empty,
                };
            }
        }
        Ok(())
    }

    pub(super) fn handle_request(&self, request: &HttpRequest, flags: RequestFlags) -> Result<HttpResponse> {
        match self {
            Leaf::Hello => {
                ensure(
                    request.method == "GET" || request.method == "HEAD",
                    || format!("hello expects GET, got {}", request.method),
                )?;
                ensure_no_body(request)?;
                Ok(HttpResponse::with_text(200, HELLO_WORLD))
            }
            Leaf::Get { status, body } => {
                ensure_no_body(request)?;
                Ok(match body {
                    Some(text) => HttpResponse::with_text(*status, text.clone()),
                    None => HttpResponse::new(*status),
                })
            }
            Leaf::Post {
                content,
                mode,
                method,
            } => {
                check_post(request, flags, content.as_deref(), *mode, method.as_deref())?;
                Ok(HttpResponse::ok())
            }
            Leaf::Delete { body } => {
                ensure(request.method == "DELETE", || {
                    format!("delete expects DELETE, got {}", request.method)
                })?;
                match body {
                    Some(expected) if !flags.contains(RequestFlags::NO_BODY) => {
                        let actual = request.body.text();
                        ensure(actual == *expected, || {
                            format!("delete body mismatch: expected {:?}, got {:?}", expected, actual)
                        })?;
                    }
                    _ => ensure_no_body(request)?,
                }
                Ok(HttpResponse::ok())
            }
        }
    }

    pub(super) fn check_response(&self, response: &HttpResponse) -> bool {
        match self {
            Leaf::Hello => response.status() == 200 && response.body().text() == HELLO_WORLD,
            Leaf::Get { status, body } => {
                response.status() == *status
                    && body
                        .as_ref()
                        .map_or(true, |text| response.body().text() == *text)
            }
            Leaf::Post { .. } | Leaf::Delete { .. } => response.status() == 200,
        }
    }
}

fn check_post(
    request: &HttpRequest,
    flags: RequestFlags,
    content: Option<&str>,
    mode: TransferMode,
    method: Option<&str>,
) -> Result<()> {
    if flags.contains(RequestFlags::REDIRECTED_AS_GET) {
        ensure(request.method == "GET", || {
            format!("a redirected POST must arrive as GET, got {}", request.method)
        })?;
        return ensure_no_body(request);
    }

    let expected_method = method.unwrap_or("POST");
    ensure(request.method == expected_method, || {
        format!("expected {}, got {}", expected_method, request.method)
    })?;

    // A replayed chunked body goes out with its length known.
    let mode = if mode == TransferMode::Chunked && flags.contains(RequestFlags::REDIRECTED) {
        TransferMode::ContentLength
    } else {
        mode
    };
    let has_length = request.headers.content_length().is_some();
    let chunked = request.headers.is_chunked();
    match mode {
        TransferMode::Chunked => {
            ensure(chunked, || "expected a chunked body".to_string())?;
            ensure(!has_length, || {
                "chunked body must not carry Content-Length".to_string()
            })?;
        }
        TransferMode::ContentLength => {
            ensure(has_length, || "expected a Content-Length header".to_string())?;
            ensure(!chunked, || {
                "content-length body must not be chunked".to_string()
            })?;
        }
        TransferMode::Default => {
            if content.is_some() {
                ensure(has_length != chunked, || {
                    "body must be framed by exactly one of Content-Length or chunked".to_string()
                })?;
            }
        }
    }

    if flags.contains(RequestFlags::NO_CONTENT_LENGTH) {
        ensure(!has_length, || "unexpected Content-Length header".to_string())?;
    }
    if flags.contains(RequestFlags::NO_BODY) {
        ensure_no_body(request)?;
    }
    if let Some(expected) = content {
        let actual = request.body.text();
        ensure(actual == expected, || {
            format!("body mismatch: expected {:?}, got {:?}", expected, actual)
        })?;
    }
    Ok(())
}
