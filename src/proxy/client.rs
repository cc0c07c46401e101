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


use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{header::HOST, HeaderValue, Version};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader},
    net::{lookup_host, TcpStream},
    time::timeout,
};
use tokio_rustls::TlsConnector;

use super::{
    flow::{BodyBuffer, RequestParts, ResponseParts},
    http1::{self, CodecError, Limits},
    target::Target,
};
use crate::{
    config::{UpstreamConfig, UpstreamProtocol},
    transport::BoxedStream,
};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-facing leg: dials ordinary destinations and performs forwarded requests over an
/// already dialed stream. Connections are owned by a single request and never pooled.
#[derive(Clone)]
pub struct UpstreamClient {
    connector: TlsConnector,
    cleartext_protocol: UpstreamProtocol,
    response_timeout: Duration,
    limits: Limits,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("cleartext_protocol", &self.cleartext_protocol)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

/// Result of a forwarded request.
#[derive(Debug)]
pub struct Forwarded {
    pub response: ResponseParts,
    pub protocol: &'static str,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig, tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(tls),
            cleartext_protocol: config.protocol,
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            limits: config.response_limits(),
        }
    }

    /// Dials a destination with no SCION address over plain TCP, trying each resolved
    /// address in turn.
    pub async fn connect_ordinary(&self, target: &Target) -> Result<BoxedStream> {
        let host = target.bare_host();
        let addrs: Vec<SocketAddr> = lookup_host((host, target.port))
            .await
            .with_context(|| format!("failed to resolve {target}"))?
            .collect();

        let mut last_err: Option<anyhow::Error> = None;
        for addr in addrs {
            tracing::debug!(%addr, "attempting upstream TCP connect");
            match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(Box::new(stream));
                }
                Ok(Err(err)) => {
                    tracing::debug!(%addr, error = %err, "upstream TCP connect failed");
                    last_err = Some(err.into());
                }
                Err(_) => {
                    tracing::warn!(%addr, "upstream TCP connect timed out after {:?}", TCP_CONNECT_TIMEOUT);
                    last_err = Some(anyhow!(
                        "TCP connect to {addr} timed out after {:?}",
                        TCP_CONNECT_TIMEOUT
                    ));
                }
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow!("DNS resolution for {target} returned no addresses"));
        Err(anyhow!("failed to connect to {target} via any resolved address: {err}"))
    }

    /// Performs `request` against `target` over `stream`. TLS origins pick the protocol by
    /// ALPN; cleartext origins use the configured protocol.
    pub async fn forward(
        &self,
        stream: BoxedStream,
        target: &Target,
        request: &RequestParts,
    ) -> Result<Forwarded> {
        let exchange = async {
            if target.tls {
                let server_name = ServerName::try_from(target.bare_host().to_string())
                    .with_context(|| format!("invalid server name: {}", target.host))?;
                let tls = match timeout(
                    TLS_HANDSHAKE_TIMEOUT,
                    self.connector.connect(server_name, stream),
                )
                .await
                {
                    Ok(result) => {
                        result.with_context(|| format!("TLS handshake failed with {target}"))?
                    }
                    Err(_) => anyhow::bail!("TLS handshake with {target} timed out"),
                };
                let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
                if h2 {
                    exchange_h2(tls, target, request, &self.limits).await
                } else {
                    exchange_http1(tls, target, request, &self.limits).await
                }
            } else {
                match self.cleartext_protocol {
                    UpstreamProtocol::H2 => exchange_h2(stream, target, request, &self.limits).await,
                    UpstreamProtocol::Http1 => {
                        exchange_http1(stream, target, request, &self.limits).await
                    }
                }
            }
        };

        match timeout(self.response_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "upstream {target} did not respond within {:?}",
                self.response_timeout
            )),
        }
    }
}

/// Copies the request minus connection-scoped headers and proxy credentials.
fn upstream_headers(request: &RequestParts) -> http::HeaderMap {
    let mut headers = request.headers.clone();
    http1::strip_hop_by_hop(&mut headers);
    headers
}

async fn exchange_http1<S>(
    stream: S,
    target: &Target,
    request: &RequestParts,
    limits: &Limits,
) -> Result<Forwarded>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut headers = upstream_headers(request);
    if !headers.contains_key(HOST) {
        let value = HeaderValue::from_str(&target.host_header())
            .context("target does not form a valid Host header")?;
        headers.insert(HOST, value);
    }
    headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));

    let outbound = RequestParts {
        method: request.method.clone(),
        uri: request.uri.clone(),
        version: Version::HTTP_11,
        headers,
        body: request.body.clone(),
    };
    let path = request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut reader = BufReader::new(stream);
    http1::write_request(&mut reader, &outbound, path)
        .await
        .context("failed to send HTTP/1.1 request upstream")?;
    let mut response = http1::read_response(&mut reader, &request.method, limits)
        .await
        .context("failed to read HTTP/1.1 response from upstream")?;
    http1::strip_hop_by_hop(&mut response.headers);

    Ok(Forwarded {
        response,
        protocol: "http/1.1",
    })
}

async fn exchange_h2<S>(
    stream: S,
    target: &Target,
    request: &RequestParts,
    limits: &Limits,
) -> Result<Forwarded>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, connection) = h2::client::handshake(stream)
        .await
        .context("failed to start HTTP/2 handshake upstream")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!("upstream h2 connection closed: {err:?}");
        }
    });

    let path = request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("{}://{}{}", target.scheme(), target.host_header(), path);

    let mut builder = http::Request::builder()
        .method(request.method.clone())
        .uri(uri)
        .version(Version::HTTP_2);
    for (name, value) in upstream_headers(request).iter() {
        if name == HOST {
            continue;
        }
        builder = builder.header(name, value);
    }
    let outbound = builder.body(()).context("failed to build HTTP/2 request")?;

    let mut client = client
        .ready()
        .await
        .context("upstream HTTP/2 connection not ready")?;
    let end_of_stream = request.body.is_empty();
    let (response_future, mut send_stream) = client
        .send_request(outbound, end_of_stream)
        .context("failed to send HTTP/2 request upstream")?;
    if !end_of_stream {
        send_stream
            .send_data(Bytes::copy_from_slice(request.body.as_bytes()), true)
            .context("failed to stream HTTP/2 request body upstream")?;
    }

    let response = response_future
        .await
        .context("upstream HTTP/2 request failed before headers")?;
    let (parts, mut body_stream) = response.into_parts();
    let mut body = BodyBuffer::default();
    while let Some(chunk) = body_stream.data().await {
        let chunk = chunk?;
        if chunk.len() > limits.max_body_bytes - body.len() {
            return Err(CodecError::BodyTooLarge {
                limit: limits.max_body_bytes,
            }
            .into());
        }
        body.push_bytes(chunk.as_ref());
        if let Err(err) = body_stream.flow_control().release_capacity(chunk.len()) {
            tracing::warn!(target = %target, ?err, "failed to release HTTP/2 flow-control capacity");
            break;
        }
    }

    Ok(Forwarded {
        response: ResponseParts {
            status: parts.status,
            version: Version::HTTP_11,
            headers: parts.headers,
            body,
        },
        protocol: "h2",
    })
}
