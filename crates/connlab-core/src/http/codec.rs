use super::{is_bodiless_status, Body, Headers, HttpRequest, HttpResponse, Version};
use crate::error::{HarnessError, Result};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CHUNK_WRITE_BYTES: usize = 4096;

/// Upper bounds applied while parsing a message.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_header_bytes: usize,
    pub max_headers: usize,
    pub max_body_bytes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_headers: 64,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

fn unexpected_eof(what: &str) -> HarnessError {
    HarnessError::exchange(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("connection closed while reading {}", what),
    ))
}

/// Reads one CRLF-terminated line, charging it against `budget`.
/// Returns `None` on EOF before any byte.
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = u64::try_from(*budget).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut line)
        .await
        .map_err(HarnessError::exchange)?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        if read > *budget {
            return Err(HarnessError::protocol("header section too large"));
        }
        return Err(unexpected_eof("a header line"));
    }
    *budget = budget.saturating_sub(read);
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| HarnessError::protocol("header line is not valid UTF-8"))
}

async fn read_headers<R>(reader: &mut R, limits: &ParseLimits, budget: &mut usize) -> Result<Headers>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    loop {
        let line = read_line(reader, budget)
            .await?
            .ok_or_else(|| unexpected_eof("headers"))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= limits.max_headers {
            return Err(HarnessError::protocol(format!(
                "more than {} headers",
                limits.max_headers
            )));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HarnessError::protocol(format!("malformed header line {:?}", line)))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(HarnessError::protocol(format!("invalid header name {:?}", name)));
        }
        headers.append(name, value.trim());
    }
}

fn parse_content_length(headers: &Headers, limits: &ParseLimits) -> Result<Option<usize>> {
    let Some(raw) = headers.content_length() else {
        return Ok(None);
    };
    let length: usize = raw
        .trim()
        .parse()
        .map_err(|_| HarnessError::protocol(format!("invalid Content-Length {:?}", raw)))?;
    if length > limits.max_body_bytes {
        return Err(HarnessError::protocol(format!(
            "body of {} bytes exceeds limit of {}",
            length, limits.max_body_bytes
        )));
    }
    Ok(Some(length))
}

async fn read_fixed<R>(reader: &mut R, length: usize) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = vec![0u8; length];
    reader.read_exact(&mut data).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            unexpected_eof("the body")
        } else {
            HarnessError::exchange(err)
        }
    })?;
    Ok(data)
}

async fn read_chunked<R>(reader: &mut R, limits: &ParseLimits) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let (data, _) = read_chunks(reader, limits, usize::MAX).await?;
    Ok(data)
}

/// Decodes chunks until the last one or until `stop_after` bytes were
/// decoded. The flag tells whether the body ended.
async fn read_chunks<R>(reader: &mut R, limits: &ParseLimits, stop_after: usize) -> Result<(Vec<u8>, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = Vec::new();
    loop {
        if data.len() >= stop_after {
            return Ok((data, false));
        }
        let mut budget = limits.max_header_bytes;
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| unexpected_eof("a chunk size"))?;
        let size_token = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| HarnessError::protocol(format!("invalid chunk size {:?}", size_token)))?;
        if size == 0 {
            // Trailers are read and discarded.
            loop {
                let trailer = read_line(reader, &mut budget)
                    .await?
                    .ok_or_else(|| unexpected_eof("chunk trailers"))?;
                if trailer.is_empty() {
                    return Ok((data, true));
                }
            }
        }
        if data.len().saturating_add(size) > limits.max_body_bytes {
            return Err(HarnessError::protocol(format!(
                "chunked body exceeds limit of {} bytes",
                limits.max_body_bytes
            )));
        }
        let wanted = stop_after - data.len();
        if size > wanted {
            data.extend_from_slice(&read_fixed(reader, wanted).await?);
            return Ok((data, false));
        }
        data.extend_from_slice(&read_fixed(reader, size).await?);
        let terminator = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| unexpected_eof("a chunk terminator"))?;
        if !terminator.is_empty() {
            return Err(HarnessError::protocol("chunk data longer than its size"));
        }
    }
}

async fn read_to_close<R>(reader: &mut R, limits: &ParseLimits) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = Vec::new();
    let limit = u64::try_from(limits.max_body_bytes)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    (&mut *reader)
        .take(limit)
        .read_to_end(&mut data)
        .await
        .map_err(HarnessError::exchange)?;
    if data.len() > limits.max_body_bytes {
        return Err(HarnessError::protocol(format!(
            "close-delimited body exceeds limit of {} bytes",
            limits.max_body_bytes
        )));
    }
    Ok(data)
}

/// Reads a request. `Ok(None)` means the peer closed the connection cleanly
/// before sending anything, which is how an idle keep-alive connection ends.
pub async fn read_request<R>(reader: &mut R, limits: &ParseLimits) -> Result<Option<HttpRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = limits.max_header_bytes;
    let Some(line) = read_line(reader, &mut budget).await? else {
        return Ok(None);
    };
    let mut parts = line.split(' ');
    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HarnessError::protocol(format!("malformed request line {:?}", line)));
    };
    if method.is_empty() || !path.starts_with('/') {
        return Err(HarnessError::protocol(format!("malformed request line {:?}", line)));
    }
    let version = Version::parse(version)
        .ok_or_else(|| HarnessError::protocol(format!("unsupported version {:?}", version)))?;
    let headers = read_headers(reader, limits, &mut budget).await?;

    let body = if headers.is_chunked() {
        if headers.contains("Content-Length") {
            return Err(HarnessError::protocol(
                "request carries both Content-Length and Transfer-Encoding",
            ));
        }
        Body::Chunked(read_chunked(reader, limits).await?)
    } else if let Some(length) = parse_content_length(&headers, limits)? {
        Body::Fixed(read_fixed(reader, length).await?)
    } else {
        Body::Empty
    };

    Ok(Some(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        version,
        headers,
        body,
        credentials: None,
    }))
}

async fn read_response_head<R>(
    reader: &mut R,
    limits: &ParseLimits,
) -> Result<(Version, u16, String, Headers)>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = limits.max_header_bytes;
    let line = read_line(reader, &mut budget)
        .await?
        .ok_or_else(|| unexpected_eof("the status line"))?;
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .and_then(Version::parse)
        .ok_or_else(|| HarnessError::protocol(format!("malformed status line {:?}", line)))?;
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| HarnessError::protocol(format!("malformed status line {:?}", line)))?;
    let reason = parts.next().unwrap_or("").to_string();
    let headers = read_headers(reader, limits, &mut budget).await?;
    Ok((version, status, reason, headers))
}

/// Reads the response to a request made with `request_method`.
pub async fn read_response<R>(
    reader: &mut R,
    limits: &ParseLimits,
    request_method: &str,
) -> Result<HttpResponse>
where
    R: AsyncBufRead + Unpin,
{
    let (version, status, reason, headers) = read_response_head(reader, limits).await?;

    let body = if request_method.eq_ignore_ascii_case("HEAD") || is_bodiless_status(status) {
        Body::Empty
    } else if headers.is_chunked() {
        Body::Chunked(read_chunked(reader, limits).await?)
    } else if let Some(length) = parse_content_length(&headers, limits)? {
        Body::Fixed(read_fixed(reader, length).await?)
    } else {
        let data = read_to_close(reader, limits).await?;
        let mut response = HttpResponse::received(version, status, reason, headers, Body::Fixed(data));
        // The body ended with the connection, so it cannot be reused.
        response.keep_alive = Some(false);
        response.close_connection = true;
        return Ok(response);
    };
    Ok(HttpResponse::received(version, status, reason, headers, body))
}

/// Like [`read_response`], but stops after `body_limit` bytes of body.
///
/// A response whose body was cut short is marked truncated and never
/// allows reuse: the rest of it is still in flight on the connection.
pub async fn read_response_prefix<R>(
    reader: &mut R,
    limits: &ParseLimits,
    request_method: &str,
    body_limit: usize,
) -> Result<HttpResponse>
where
    R: AsyncBufRead + Unpin,
{
    let (version, status, reason, headers) = read_response_head(reader, limits).await?;
    if request_method.eq_ignore_ascii_case("HEAD") || is_bodiless_status(status) {
        return Ok(HttpResponse::received(version, status, reason, headers, Body::Empty));
    }

    let (data, complete) = if headers.is_chunked() {
        let (data, complete) = read_chunks(reader, limits, body_limit).await?;
        if complete {
            let body = Body::Chunked(data);
            return Ok(HttpResponse::received(version, status, reason, headers, body));
        }
        (data, false)
    } else if let Some(length) = parse_content_length(&headers, limits)? {
        if length <= body_limit {
            let body = Body::Fixed(read_fixed(reader, length).await?);
            return Ok(HttpResponse::received(version, status, reason, headers, body));
        }
        (read_fixed(reader, body_limit).await?, false)
    } else {
        let mut data = Vec::new();
        (&mut *reader)
            .take(u64::try_from(body_limit).unwrap_or(u64::MAX))
            .read_to_end(&mut data)
            .await
            .map_err(HarnessError::exchange)?;
        let complete = data.len() < body_limit;
        (data, complete)
    };

    let mut response = HttpResponse::received(version, status, reason, headers, Body::Fixed(data));
    response.keep_alive = Some(false);
    response.close_connection = true;
    response.truncated = !complete;
    Ok(response)
}

async fn write_body<W>(writer: &mut W, body: &Body) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match body {
        Body::Empty => Ok(()),
        Body::Fixed(data) => writer.write_all(data).await,
        Body::Chunked(data) => {
            for chunk in data.chunks(CHUNK_WRITE_BYTES) {
                writer
                    .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                    .await?;
                writer.write_all(chunk).await?;
                writer.write_all(b"\r\n").await?;
            }
            writer.write_all(b"0\r\n\r\n").await
        }
    }
}

fn push_headers(head: &mut String, headers: &Headers) {
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
}

/// Writes a request. Framing headers missing for the body are added.
pub async fn write_request<W>(writer: &mut W, request: &HttpRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = request.headers.clone();
    match &request.body {
        Body::Chunked(_) => {
            headers.remove("Content-Length");
            headers.set("Transfer-Encoding", "chunked");
        }
        Body::Fixed(data) => {
            if !headers.contains("Content-Length") {
                headers.set("Content-Length", data.len().to_string());
            }
        }
        Body::Empty => {}
    }
    let mut head = format!("{} {} {}\r\n", request.method, request.path, request.version);
    push_headers(&mut head, &headers);
    writer
        .write_all(head.as_bytes())
        .await
        .map_err(HarnessError::exchange)?;
    write_body(writer, &request.body)
        .await
        .map_err(HarnessError::exchange)?;
    writer.flush().await.map_err(HarnessError::exchange)
}

/// Resolves (if needed) and writes a response.
pub async fn write_response<W>(writer: &mut W, response: &mut HttpResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    response.resolve_headers();
    let mut head = format!(
        "{} {} {}\r\n",
        response.version(),
        response.status(),
        response.reason()
    );
    push_headers(&mut head, response.headers());
    writer
        .write_all(head.as_bytes())
        .await
        .map_err(HarnessError::exchange)?;
    write_body(writer, response.body())
        .await
        .map_err(HarnessError::exchange)?;
    writer.flush().await.map_err(HarnessError::exchange)
}
