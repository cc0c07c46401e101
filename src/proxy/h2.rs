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


//! HTTP/2 helpers: buffering a request stream, sending buffered responses, and exposing a
//! CONNECT stream as a plain byte stream.

use std::{
    io,
    pin::Pin,
    task::{ready, Context as TaskContext, Poll},
};

use anyhow::{anyhow, Context, Result};
use bytes::{Buf, Bytes};
use h2::{server::SendResponse, RecvStream, SendStream};
use http::{HeaderName, Version};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{
    flow::{BodyBuffer, RequestParts, ResponseParts},
    http1::{CodecError, HOP_BY_HOP_HEADERS},
};

const CHUNK_SIZE: usize = 16 * 1024;

/// Converts an inbound h2 request into [`RequestParts`], buffering up to `max_body` bytes
/// of body and releasing flow-control credit as it goes.
pub async fn request_parts_from_h2(
    request: http::Request<RecvStream>,
    max_body: usize,
) -> Result<RequestParts> {
    let (parts, mut body_stream) = request.into_parts();
    let mut body = BodyBuffer::default();

    while let Some(frame) = body_stream.data().await {
        let chunk = frame?;
        if chunk.len() > max_body - body.len() {
            return Err(CodecError::BodyTooLarge { limit: max_body }.into());
        }
        body.push_bytes(&chunk);
        if let Err(err) = body_stream.flow_control().release_capacity(chunk.len()) {
            tracing::warn!(?err, "failed to release client HTTP/2 flow-control capacity");
            break;
        }
    }

    Ok(RequestParts {
        method: parts.method,
        uri: parts.uri,
        version: parts.version,
        headers: parts.headers,
        body,
    })
}

/// Drops connection-specific headers and lowercases names for the h2 wire.
pub fn sanitize_headers_for_h2(response: &mut ResponseParts) -> Result<()> {
    let mut sanitized = http::HeaderMap::new();
    for (name, value) in response.headers.iter() {
        let lowered = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.iter().any(|hop| hop == &lowered) {
            continue;
        }
        let header_name = HeaderName::from_bytes(lowered.as_bytes())
            .context("invalid header name during HTTP/2 normalization")?;
        sanitized.append(header_name, value.clone());
    }
    response.headers = sanitized;
    Ok(())
}

fn build_response_head(response: &ResponseParts) -> Result<http::Response<()>> {
    let mut builder = http::Response::builder()
        .status(response.status)
        .version(Version::HTTP_2);
    for (name, value) in response.headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(())
        .map_err(|err| anyhow!("failed to build HTTP/2 response head: {err}"))
}

/// Sends a buffered response on a client stream, HEADERS first then DATA in 16KB frames.
pub fn send_response(respond: &mut SendResponse<Bytes>, response: &ResponseParts) -> Result<()> {
    let mut response = ResponseParts {
        status: response.status,
        version: Version::HTTP_2,
        headers: response.headers.clone(),
        body: response.body.clone(),
    };
    sanitize_headers_for_h2(&mut response)?;
    let head = build_response_head(&response)?;
    let has_body = !response.body.is_empty();

    let mut stream = respond
        .send_response(head, !has_body)
        .context("failed to send HTTP/2 response headers to client")?;
    if has_body {
        send_body(&mut stream, response.body.as_bytes())
            .context("failed to stream HTTP/2 response body to client")?;
    }
    Ok(())
}

/// Queues `body` in 16KB DATA frames, ending the stream with the last one.
pub fn send_body(stream: &mut SendStream<Bytes>, body: &[u8]) -> Result<()> {
    if body.is_empty() {
        stream.send_data(Bytes::new(), true)?;
        return Ok(());
    }
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + CHUNK_SIZE).min(body.len());
        let chunk = Bytes::copy_from_slice(&body[offset..end]);
        stream
            .send_data(chunk, end == body.len())
            .context("failed to write HTTP/2 data frame")?;
        offset = end;
    }
    Ok(())
}

/// An h2 stream pair viewed as a duplex byte stream: inbound DATA frames are read, writes
/// become outbound DATA frames. Shutdown ends the outbound stream.
///
/// Built for the client side of an HTTP/2 CONNECT so the tunnel relay never sees HTTP/2;
/// the server side of a tunnel is always a dialed byte stream.
pub struct H2Stream {
    recv: RecvStream,
    send: SendStream<Bytes>,
    pending: Bytes,
    recv_done: bool,
}

impl H2Stream {
    pub fn new(recv: RecvStream, send: SendStream<Bytes>) -> Self {
        Self {
            recv,
            send,
            pending: Bytes::new(),
            recv_done: false,
        }
    }
}

impl std::fmt::Debug for H2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Stream")
            .field("pending", &self.pending.len())
            .field("recv_done", &self.recv_done)
            .finish()
    }
}

fn h2_to_io(err: h2::Error) -> io::Error {
    if err.is_io() {
        match err.into_io() {
            Some(io_err) => io_err,
            None => io::Error::new(io::ErrorKind::Other, "h2 I/O error"),
        }
    } else {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.recv_done {
                return Poll::Ready(Ok(()));
            }

            match ready!(self.recv.poll_data(cx)) {
                Some(Ok(chunk)) => {
                    let len = chunk.len();
                    if let Err(err) = self.recv.flow_control().release_capacity(len) {
                        return Poll::Ready(Err(h2_to_io(err)));
                    }
                    self.pending = chunk;
                }
                Some(Err(err)) => return Poll::Ready(Err(h2_to_io(err))),
                None => self.recv_done = true,
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        self.send.reserve_capacity(buf.len().min(CHUNK_SIZE));
        loop {
            let available = self.send.capacity();
            if available > 0 {
                let n = available.min(buf.len());
                self.send
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .map_err(h2_to_io)?;
                return Poll::Ready(Ok(n));
            }
            match ready!(self.send.poll_capacity(cx)) {
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Poll::Ready(Err(h2_to_io(err))),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "HTTP/2 stream closed for sending",
                    )))
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        // An error here means the stream already ended or was reset; either way it is closed.
        if let Err(err) = self.send.send_data(Bytes::new(), true) {
            tracing::trace!(?err, "HTTP/2 stream already closed on shutdown");
        }
        Poll::Ready(Ok(()))
    }
}
