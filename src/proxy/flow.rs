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


use bytes::BytesMut;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use uuid::Uuid;

/// Flow tracks everything we know about a single HTTP request/response pair as it moves
/// through the proxy. Each HTTP/1.1 request or HTTP/2 stream gets its own Flow.
///
/// A Flow is created as soon as the request head is parsed, handed to the tunnel engine or
/// the management API, and logged through telemetry once the exchange finishes. Flows are
/// owned by a single task, so mutating them with `&mut` needs no synchronization.
#[derive(Debug)]
pub struct Flow {
    /// Unique identifier for this request/response pair (UUID v7 = timestamp-sortable).
    pub id: Uuid,

    /// Parsed HTTP request from the client (method, URI, headers, body).
    pub request: RequestParts,

    /// What the engine learned while serving the request (identity, route, path).
    pub metadata: FlowMetadata,
}

impl Flow {
    pub fn new(request: RequestParts) -> Self {
        Self {
            id: Uuid::now_v7(),
            request,
            metadata: FlowMetadata::default(),
        }
    }
}

/// Parsed HTTP request components (method, URI, version, headers, body).
///
/// We keep an owned version of the request rather than a streaming body so the engine can
/// inspect the target and rewrite hop-by-hop headers before forwarding.
#[derive(Debug)]
pub struct RequestParts {
    pub method: Method,

    pub uri: Uri,

    pub version: Version,

    pub headers: HeaderMap,

    pub body: BodyBuffer,
}

impl Default for RequestParts {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::from_static("/"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: BodyBuffer::default(),
        }
    }
}

/// Parsed HTTP response components (status, version, headers, body).
#[derive(Debug, Default)]
pub struct ResponseParts {
    pub status: StatusCode,

    pub version: Version,

    pub headers: HeaderMap,

    pub body: BodyBuffer,
}

impl ResponseParts {
    /// Empty-bodied response with the given status.
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// Growable byte buffer for HTTP request/response bodies.
///
/// Bodies are fully buffered in memory via `BytesMut`. Only forwarded requests go through
/// here; tunnels never buffer.
#[derive(Debug, Default, Clone)]
pub struct BodyBuffer {
    data: BytesMut,
}

impl BodyBuffer {
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<&[u8]> for BodyBuffer {
    fn from(value: &[u8]) -> Self {
        let mut body = Self::default();
        body.push_bytes(value);
        body
    }
}

/// Typed scratchpad the engine fills in so telemetry can record the final state of the flow.
#[derive(Debug, Default)]
pub struct FlowMetadata {
    pub identity: Option<String>,

    /// `host:port` the client asked for.
    pub target: Option<String>,

    pub client_protocol: Option<&'static str>,

    pub upstream_protocol: Option<&'static str>,

    /// `scion` when the target resolved to a SCION address, `ip` for ordinary routing.
    pub route: Option<&'static str>,

    pub scion_address: Option<String>,

    pub path_id: Option<String>,

    pub status: Option<u16>,

    pub bytes_up: u64,

    pub bytes_down: u64,
}
