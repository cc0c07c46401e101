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


use std::fmt;

use http::{header::HOST, uri::Scheme, Uri};

use super::flow::RequestParts;
use crate::utils::HandlerError;

/// Host and port a proxy request is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Hostname or IP literal; IPv6 stays bracketed as in the URI.
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Target {
    /// Target of a CONNECT: the authority-form request target (or `:authority` on h2).
    pub fn from_connect(uri: &Uri) -> Result<Self, HandlerError> {
        let authority = uri
            .authority()
            .ok_or_else(|| HandlerError::bad_request("CONNECT target must be host:port"))?;
        let port = authority
            .port_u16()
            .ok_or_else(|| HandlerError::bad_request("CONNECT target is missing a port"))?;
        Ok(Self {
            host: authority.host().to_string(),
            port,
            tls: port == 443,
        })
    }

    /// Target of a forwarded request: the absolute URI, else the `Host` header with the
    /// port inferred from the scheme.
    pub fn from_forward(request: &RequestParts) -> Result<Self, HandlerError> {
        let tls = request.uri.scheme() == Some(&Scheme::HTTPS);
        let default_port = if tls { 443 } else { 80 };

        if let Some(authority) = request.uri.authority() {
            return Ok(Self {
                host: authority.host().to_string(),
                port: authority.port_u16().unwrap_or(default_port),
                tls,
            });
        }

        let host = request
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| HandlerError::bad_request("request has no target host"))?;
        let authority: http::uri::Authority = host
            .parse()
            .map_err(|_| HandlerError::bad_request(format!("invalid Host header {host:?}")))?;
        Ok(Self {
            host: authority.host().to_string(),
            port: authority.port_u16().unwrap_or(default_port),
            tls,
        })
    }

    /// Host without IPv6 brackets, for sockets and TLS server names.
    pub fn bare_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// `Host` header value, omitting the scheme's default port.
    pub fn host_header(&self) -> String {
        match (self.tls, self.port) {
            (true, 443) | (false, 80) => self.host.clone(),
            _ => self.to_string(),
        }
    }

    /// Whether this target names one of the given `host[:port]` authorities.
    pub fn matches_authority(&self, authority: &str) -> bool {
        let Ok(parsed) = authority.parse::<http::uri::Authority>() else {
            return false;
        };
        if !parsed.host().eq_ignore_ascii_case(&self.host) {
            return false;
        }
        match parsed.port_u16() {
            Some(port) => port == self.port,
            None => true,
        }
    }
}
