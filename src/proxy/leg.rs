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


use anyhow::{Context, Result};
use bytes::Bytes;
use h2::{server::SendResponse, RecvStream};
use http::StatusCode;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::{flow::ResponseParts, h2::H2Stream, h2::send_response, http1};
use crate::transport::BoxedStream;

/// Buffered client connection the HTTP/1.1 leg reads requests from and writes responses to.
pub trait ClientIo: AsyncBufRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncBufRead + AsyncWrite + Send + Unpin> ClientIo for T {}

/// The client-facing side of one request, in whichever protocol the client speaks.
pub enum ClientLeg<'a> {
    Http1(&'a mut dyn ClientIo),
    Http2 {
        respond: SendResponse<Bytes>,
        /// Request body of a CONNECT stream, kept unread so it can become the tunnel.
        body: Option<RecvStream>,
    },
}

/// How the connection continues after a request has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepAlive,
    Close,
}

/// Client side of an established tunnel.
pub enum TunnelEnd<'a> {
    Http1(&'a mut dyn ClientIo),
    Http2(H2Stream),
}

impl<'a> ClientLeg<'a> {
    pub fn protocol(&self) -> &'static str {
        match self {
            ClientLeg::Http1(_) => "http/1.1",
            ClientLeg::Http2 { .. } => "h2",
        }
    }

    pub async fn send_response(&mut self, response: &ResponseParts) -> Result<()> {
        match self {
            ClientLeg::Http1(io) => http1::write_response(&mut **io, response).await,
            ClientLeg::Http2 { respond, .. } => send_response(respond, response),
        }
    }

    /// Answers a CONNECT with 200 and hands back the client side as a byte stream.
    pub async fn establish_tunnel(self) -> Result<TunnelEnd<'a>> {
        match self {
            ClientLeg::Http1(io) => {
                io.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .context("failed to confirm tunnel to client")?;
                io.flush().await?;
                Ok(TunnelEnd::Http1(io))
            }
            ClientLeg::Http2 { mut respond, body } => {
                let recv = body.context("HTTP/2 CONNECT stream has no request body")?;
                let head = http::Response::builder()
                    .status(StatusCode::OK)
                    .body(())
                    .context("failed to build HTTP/2 CONNECT response")?;
                let send = respond
                    .send_response(head, false)
                    .context("failed to confirm HTTP/2 tunnel to client")?;
                Ok(TunnelEnd::Http2(H2Stream::new(recv, send)))
            }
        }
    }
}

impl<'a> TunnelEnd<'a> {
    /// Relays bytes until either side closes, returning `(client→upstream, upstream→client)`.
    pub async fn relay(self, upstream: &mut BoxedStream) -> std::io::Result<(u64, u64)> {
        match self {
            TunnelEnd::Http1(io) => super::relay::relay(io, upstream).await,
            TunnelEnd::Http2(mut stream) => super::relay::relay(&mut stream, upstream).await,
        }
    }
}
