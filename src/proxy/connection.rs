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

use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use h2::{server::SendResponse, RecvStream};
use http::{Method, StatusCode};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::{sleep, timeout, Duration},
};
use tokio_rustls::TlsAcceptor;

use super::{
    engine,
    flow::{Flow, RequestParts},
    h2::{self as h2_helpers, request_parts_from_h2},
    http1::{self, CodecError},
    leg::{ClientLeg, Disposition},
};
use crate::{context::ProxyContext, utils::HandlerError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const H2_PREFACE_PREFIX: &[u8] = b"PRI ";
const PREFACE_PEEK_ATTEMPTS: usize = 20;

#[derive(Debug, PartialEq)]
enum Protocol {
    Tls,
    Http2PriorKnowledge,
    Http,
    Unknown,
}

/// Peeks at the first bytes without consuming them: 0x16 opens a TLS handshake, `PRI `
/// opens the HTTP/2 connection preface, an ASCII letter opens an HTTP/1 request line.
async fn detect_protocol(socket: &TcpStream) -> Result<Protocol> {
    let mut buf = [0u8; 4];
    for _ in 0..PREFACE_PEEK_ATTEMPTS {
        let n = socket.peek(&mut buf).await?;
        if n == 0 {
            return Err(anyhow!("connection closed before first byte"));
        }
        if buf[0] == 0x16 {
            return Ok(Protocol::Tls);
        }
        if !buf[0].is_ascii_uppercase() {
            return Ok(Protocol::Unknown);
        }
        if n >= H2_PREFACE_PREFIX.len() || !H2_PREFACE_PREFIX.starts_with(&buf[..n]) {
            return Ok(if buf[..n] == *H2_PREFACE_PREFIX {
                Protocol::Http2PriorKnowledge
            } else {
                Protocol::Http
            });
        }
        // A prefix of "PRI " so far; wait for the rest to arrive.
        sleep(Duration::from_millis(5)).await;
    }
    Ok(Protocol::Http)
}

/// Serves one accepted client connection until it closes, a tunnel takes it over, or the
/// context shuts down.
///
/// With a TLS acceptor the handshake is terminated here and ALPN picks HTTP/2 or HTTP/1.1.
/// Without one the socket is cleartext: HTTP/2 with prior knowledge when the preface shows
/// up, HTTP/1.1 otherwise.
pub async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    let protocol = detect_protocol(&socket).await?;

    match (protocol, tls) {
        (Protocol::Tls, Some(acceptor)) => {
            tracing::debug!(%peer, "starting TLS handshake");
            let client_tls = match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
                Ok(result) => result.with_context(|| format!("TLS handshake failed for {peer}"))?,
                Err(_) => {
                    return Err(anyhow!(
                        "TLS handshake timed out for {peer} after {:?}",
                        HANDSHAKE_TIMEOUT
                    ))
                }
            };

            let h2 = client_tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
            if h2 {
                tracing::debug!(%peer, "negotiated HTTP/2 with client");
                serve_http2(client_tls, peer, ctx).await
            } else {
                tracing::debug!(%peer, "negotiated HTTP/1.1 with client");
                serve_http1(client_tls, peer, ctx).await
            }
        }
        (Protocol::Tls, None) => {
            tracing::warn!(%peer, "rejecting TLS client on a plaintext listener");
            Err(anyhow!("TLS is not enabled on this listener"))
        }
        (Protocol::Http | Protocol::Http2PriorKnowledge, Some(_)) => {
            tracing::warn!(%peer, "rejecting cleartext client on a TLS listener");
            Err(anyhow!("cleartext HTTP on a TLS listener"))
        }
        (Protocol::Http2PriorKnowledge, None) => {
            tracing::debug!(%peer, "HTTP/2 prior knowledge");
            serve_http2(socket, peer, ctx).await
        }
        (Protocol::Http, None) => serve_http1(socket, peer, ctx).await,
        (Protocol::Unknown, _) => {
            tracing::warn!(%peer, "rejecting connection with unknown protocol");
            Err(anyhow!("unknown protocol"))
        }
    }
}

/// HTTP/1.1 keep-alive loop. Each request is a fresh flow; a tunnel ends the loop.
async fn serve_http1<S>(stream: S, peer: SocketAddr, ctx: Arc<ProxyContext>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut io = BufReader::new(stream);
    let shutdown = ctx.shutdown_token();
    let limits = ctx.request_limits();

    loop {
        let next = tokio::select! {
            next = http1::read_request(&mut io, &limits) => next,
            _ = shutdown.cancelled() => break,
        };
        let request = match next {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                let response = rejection(&err).into_response();
                let _ = http1::write_response(&mut io, &response).await;
                let _ = io.shutdown().await;
                return Err(err.context(format!("bad request from {peer}")));
            }
        };

        tracing::debug!(%peer, method = %request.method, uri = %request.uri, "parsed HTTP/1.1 request");
        let keep_alive = http1::wants_keep_alive(&request);
        let mut flow = Flow::new(request);
        let disposition = engine::serve(&ctx, &mut flow, ClientLeg::Http1(&mut io)).await?;
        if disposition == Disposition::Close || !keep_alive {
            break;
        }
    }

    let _ = io.shutdown().await;
    Ok(())
}

/// Accepts streams on an HTTP/2 connection, one task per stream.
async fn serve_http2<S>(stream: S, peer: SocketAddr, ctx: Arc<ProxyContext>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut connection = h2::server::handshake(stream)
        .await
        .context("failed to negotiate HTTP/2 with client")?;
    let shutdown = ctx.shutdown_token();
    let mut closing = false;

    loop {
        let accepted = if closing {
            Some(connection.accept().await)
        } else {
            tokio::select! {
                accepted = connection.accept() => Some(accepted),
                _ = shutdown.cancelled() => None,
            }
        };
        let Some(accepted) = accepted else {
            connection.graceful_shutdown();
            closing = true;
            continue;
        };
        let Some(result) = accepted else {
            break;
        };

        let (request, respond) = result?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = serve_http2_stream(request, respond, &ctx).await {
                tracing::debug!(%peer, "HTTP/2 stream task ended with error: {err:?}");
            }
        });
    }

    Ok(())
}

async fn serve_http2_stream(
    request: http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    ctx: &ProxyContext,
) -> Result<()> {
    if request.method() == Method::CONNECT {
        // The request body is the client half of the tunnel; leave it unread.
        let (parts, body) = request.into_parts();
        let mut flow = Flow::new(RequestParts {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: Default::default(),
        });
        let leg = ClientLeg::Http2 {
            respond,
            body: Some(body),
        };
        engine::serve(ctx, &mut flow, leg).await?;
        return Ok(());
    }

    let request = match request_parts_from_h2(request, ctx.request_limits().max_body_bytes).await {
        Ok(request) => request,
        Err(err) => {
            let response = rejection(&err).into_response();
            let _ = h2_helpers::send_response(&mut respond, &response);
            return Err(err);
        }
    };
    let mut flow = Flow::new(request);
    let leg = ClientLeg::Http2 {
        respond,
        body: None,
    };
    engine::serve(ctx, &mut flow, leg).await?;
    Ok(())
}

/// Maps a request that could not be read to the response the client gets.
fn rejection(err: &anyhow::Error) -> HandlerError {
    match err.downcast_ref::<CodecError>() {
        Some(too_large @ CodecError::BodyTooLarge { .. }) => {
            HandlerError::new(StatusCode::PAYLOAD_TOO_LARGE, too_large.to_string())
        }
        Some(too_large @ CodecError::HeadTooLarge { .. }) => {
            HandlerError::new(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, too_large.to_string())
        }
        None => HandlerError::bad_request("malformed HTTP request"),
    }
}
