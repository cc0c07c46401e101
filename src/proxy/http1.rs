/* SCION Forward Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/


//! HTTP/1.x wire codec shared by the client leg and the upstream leg.
//!
//! Messages are buffered whole into [`RequestParts`]/[`ResponseParts`]. Chunked bodies are
//! decoded and re-framed with `Content-Length` on the way out, so the codec never emits
//! chunked encoding itself.

use anyhow::{Context, Result};
use http::{
    header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version,
};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::flow::{BodyBuffer, RequestParts, ResponseParts};

pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Size caps applied while parsing. The head covers the start line and every header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// A message refused for its size. Raised before the oversized part is buffered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("message head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("message body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// Headers that describe a single connection and never travel across the proxy.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-authenticate",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// Reads one request head and body. Returns `None` when the peer closed the connection
/// cleanly before sending anything.
pub async fn read_request<R>(reader: &mut R, limits: &Limits) -> Result<Option<RequestParts>>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = limits.max_head_bytes;
    let mut line = String::new();
    // Tolerate stray CRLFs between keep-alive requests.
    loop {
        line.clear();
        let read = read_head_line(reader, &mut line, &mut budget, limits.max_head_bytes)
            .await
            .context("failed to read request line")?;
        if read == 0 {
            return Ok(None);
        }
        if !trim_crlf(&line).is_empty() {
            break;
        }
    }

    let parts: Vec<&str> = trim_crlf(&line).split_whitespace().collect();
    if parts.len() != 3 {
        anyhow::bail!("malformed HTTP request line: {:?}", trim_crlf(&line));
    }

    let method = parts[0]
        .parse::<Method>()
        .with_context(|| format!("invalid method {}", parts[0]))?;
    let uri = parts[1]
        .parse::<http::Uri>()
        .with_context(|| format!("invalid request target {}", parts[1]))?;
    let version = parse_version(parts[2]);
    let headers = read_headers(reader, &mut budget, limits.max_head_bytes).await?;

    let mut body = BodyBuffer::default();
    if method != Method::CONNECT {
        if has_chunked_encoding(&headers) {
            read_chunked_body(reader, limits, &mut body).await?;
        } else if let Some(len) = content_length(&headers)? {
            read_fixed_body(reader, len, limits.max_body_bytes, &mut body).await?;
        }
    }

    Ok(Some(RequestParts {
        method,
        uri,
        version,
        headers,
        body,
    }))
}

/// Parses a full HTTP/1.x response from the origin.
///
/// 1xx/204/205/304 and HEAD responses carry no body. Bodies with neither `Content-Length`
/// nor chunked framing run until the origin closes, up to the body limit.
pub async fn read_response<R>(
    reader: &mut R,
    request_method: &Method,
    limits: &Limits,
) -> Result<ResponseParts>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = limits.max_head_bytes;
    let mut status_line = String::new();
    let read = read_head_line(reader, &mut status_line, &mut budget, limits.max_head_bytes)
        .await
        .context("failed to read response status line")?;
    if read == 0 {
        anyhow::bail!("upstream closed connection before sending status line");
    }

    let status_line = trim_crlf(&status_line);
    let mut parts = status_line.splitn(3, ' ');
    let version_str = parts.next().context("response line missing HTTP version")?;
    let status_str = parts.next().context("response line missing status code")?;

    let status_code: u16 = status_str
        .parse()
        .with_context(|| format!("invalid status code: {status_str}"))?;
    let status = StatusCode::from_u16(status_code)
        .with_context(|| format!("unsupported status code: {status_code}"))?;

    let mut response = ResponseParts {
        status,
        version: parse_version(version_str),
        headers: read_headers(reader, &mut budget, limits.max_head_bytes).await?,
        body: BodyBuffer::default(),
    };

    match response_body_encoding(&response.headers, &response.status, request_method)? {
        BodyEncoding::None => {}
        BodyEncoding::ContentLength(len) => {
            read_fixed_body(reader, len, limits.max_body_bytes, &mut response.body).await?;
        }
        BodyEncoding::Chunked => {
            read_chunked_body(reader, limits, &mut response.body).await?;
            normalize_content_length(&mut response.headers, response.body.len())?;
        }
        BodyEncoding::UntilClose => {
            let limit = limits.max_body_bytes;
            let mut buf = Vec::new();
            (&mut *reader)
                .take((limit as u64).saturating_add(1))
                .read_to_end(&mut buf)
                .await
                .context("failed to read close-delimited body")?;
            if buf.len() > limit {
                return Err(CodecError::BodyTooLarge { limit }.into());
            }
            response.body.push_bytes(&buf);
            normalize_content_length(&mut response.headers, response.body.len())?;
        }
    }

    Ok(response)
}

/// Serializes a request with the given request-target (origin-form path or authority).
pub async fn write_request<W>(writer: &mut W, req: &RequestParts, target: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let request_line = format!("{} {} HTTP/1.1\r\n", req.method, target);
    writer.write_all(request_line.as_bytes()).await?;
    write_headers(writer, &req.headers).await?;
    if !req.body.is_empty() {
        writer.write_all(req.body.as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Serializes a buffered response, framing the body with `Content-Length`.
pub async fn write_response<W>(writer: &mut W, response: &ResponseParts) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let reason = response.status.canonical_reason().unwrap_or("");
    let status_line = format!(
        "{} {} {}\r\n",
        match response.version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        },
        response.status.as_u16(),
        reason
    );
    writer.write_all(status_line.as_bytes()).await?;

    let mut headers = response.headers.clone();
    if body_allowed(response.status) {
        normalize_content_length(&mut headers, response.body.len())?;
    }
    write_headers(writer, &headers).await?;

    if !response.body.is_empty() {
        writer.write_all(response.body.as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Whether the client expects the connection to stay open after this request.
pub fn wants_keep_alive(req: &RequestParts) -> bool {
    let tokens: Vec<String> = req
        .headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect();

    if tokens.iter().any(|t| t == "close") {
        return false;
    }
    match req.version {
        Version::HTTP_10 | Version::HTTP_09 => tokens.iter().any(|t| t == "keep-alive"),
        _ => true,
    }
}

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for hop in HOP_BY_HOP_HEADERS {
        headers.remove(*hop);
    }
}

pub fn normalize_content_length(headers: &mut HeaderMap, len: usize) -> Result<()> {
    headers.remove(TRANSFER_ENCODING);
    let value = HeaderValue::from_str(&len.to_string()).context("invalid content-length value")?;
    headers.insert(CONTENT_LENGTH, value);
    Ok(())
}

/// Reads one line, charging it against the remaining head `budget`. Never buffers more
/// than one byte past the budget.
async fn read_head_line<R>(
    reader: &mut R,
    line: &mut String,
    budget: &mut usize,
    limit: usize,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader)
        .take((*budget as u64).saturating_add(1))
        .read_line(line)
        .await?;
    if read > *budget {
        return Err(CodecError::HeadTooLarge { limit }.into());
    }
    *budget -= read;
    Ok(read)
}

async fn read_headers<R>(reader: &mut R, budget: &mut usize, limit: usize) -> Result<HeaderMap>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let mut line = String::new();
        let read = read_head_line(reader, &mut line, budget, limit)
            .await
            .context("failed to read header line")?;
        if read == 0 {
            anyhow::bail!("unexpected EOF while reading headers");
        }
        let trimmed = trim_crlf(&line);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
    }
    Ok(headers)
}

async fn write_headers<W>(writer: &mut W, headers: &HeaderMap) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for (name, value) in headers {
        writer.write_all(name.as_str().as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b"\r\n").await?;
    Ok(())
}

/// Reads exactly `len` bytes, refusing lengths above `limit` before reading any.
async fn read_fixed_body<R>(reader: &mut R, len: u64, limit: usize, body: &mut BodyBuffer) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    if len == 0 {
        return Ok(());
    }
    if len > limit as u64 {
        return Err(CodecError::BodyTooLarge { limit }.into());
    }
    let mut buf = Vec::new();
    (&mut *reader)
        .take(len)
        .read_to_end(&mut buf)
        .await
        .context("failed to read body")?;
    if (buf.len() as u64) < len {
        anyhow::bail!("expected {len} body bytes, hit EOF after {}", buf.len());
    }
    body.push_bytes(&buf);
    Ok(())
}

async fn read_chunked_body<R>(reader: &mut R, limits: &Limits, body: &mut BodyBuffer) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let limit = limits.max_body_bytes;
    loop {
        let mut size_line = String::new();
        let mut line_budget = limits.max_head_bytes;
        let read = read_head_line(reader, &mut size_line, &mut line_budget, limits.max_head_bytes)
            .await
            .context("failed to read chunk size line")?;
        if read == 0 {
            anyhow::bail!("unexpected EOF while reading chunk size");
        }

        let size_str = trim_crlf(&size_line);
        let size_token = size_str.split(';').next().unwrap_or(size_str).trim();
        let size = u64::from_str_radix(size_token, 16)
            .with_context(|| format!("invalid chunk size: {size_token}"))?;

        if size == 0 {
            consume_trailer_section(reader, limits.max_head_bytes).await?;
            break;
        }

        let remaining = (limit - body.len()) as u64;
        if size > remaining {
            return Err(CodecError::BodyTooLarge { limit }.into());
        }
        read_fixed_body(reader, size, limit, body)
            .await
            .context("failed to read chunk")?;

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .context("failed to read chunk terminator")?;
        if crlf != [b'\r', b'\n'] {
            anyhow::bail!("chunk missing CRLF terminator");
        }
    }
    Ok(())
}

async fn consume_trailer_section<R>(reader: &mut R, limit: usize) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = limit;
    loop {
        let mut line = String::new();
        let read = read_head_line(reader, &mut line, &mut budget, limit).await?;
        if read == 0 || line.trim().is_empty() {
            break;
        }
    }
    Ok(())
}

fn trim_crlf(input: &str) -> &str {
    input.trim_end_matches(['\r', '\n'])
}

fn parse_version(raw: &str) -> Version {
    match raw {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/0.9" => Version::HTTP_09,
        _ => Version::HTTP_11,
    }
}

enum BodyEncoding {
    None,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

fn body_allowed(status: StatusCode) -> bool {
    !(status.is_informational() || matches!(status.as_u16(), 204 | 304))
}

fn response_body_encoding(
    headers: &HeaderMap,
    status: &StatusCode,
    method: &Method,
) -> Result<BodyEncoding> {
    if method == Method::HEAD || !body_allowed(*status) || status.as_u16() == 205 {
        return Ok(BodyEncoding::None);
    }
    // A successful CONNECT switches the connection to the tunnel.
    if method == Method::CONNECT && status.is_success() {
        return Ok(BodyEncoding::None);
    }
    if has_chunked_encoding(headers) {
        return Ok(BodyEncoding::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(len) => BodyEncoding::ContentLength(len),
        None => BodyEncoding::UntilClose,
    })
}

/// A present but unparsable `Content-Length` is an error rather than "no body".
fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(None);
    };
    let raw = value.to_str().context("non-ASCII content-length")?;
    let len = raw
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid content-length: {raw}"))?;
    Ok(Some(len))
}

fn has_chunked_encoding(headers: &HeaderMap) -> bool {
    headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.to_ascii_lowercase()
                .split(',')
                .any(|enc| enc.trim() == "chunked")
        })
        .unwrap_or(false)
}
