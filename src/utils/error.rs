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


use http::{
    header::{CONTENT_TYPE, PROXY_AUTHENTICATE},
    HeaderValue, StatusCode,
};
use thiserror::Error;

use crate::proxy::flow::{BodyBuffer, ResponseParts};

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Startup and wiring failures. Anything that happens after the listener is up is scoped to a
/// single request and travels as a [`HandlerError`] instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("trusted resolver unreachable at {addr}: {reason}")]
    TrustedResolver { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Body sent with every 407, regardless of why the credential was refused.
pub const PROXY_AUTH_REQUIRED_MESSAGE: &str = "required to pass valid proxy authorization header";

/// Structured error returned by every proxy-facing and management handler.
///
/// Handlers never write status codes themselves; the connection layer calls
/// [`HandlerError::into_response`] and sends the result over whichever protocol the client
/// speaks. The wire body is the message followed by a newline.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub status: StatusCode,
    pub message: String,
    realm: Option<String>,
}

impl HandlerError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            realm: None,
        }
    }

    pub fn proxy_auth_required(realm: &str) -> Self {
        Self {
            status: StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            message: PROXY_AUTH_REQUIRED_MESSAGE.to_string(),
            realm: Some(realm.to_string()),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "404 page not found")
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Renders the error as a plaintext response.
    pub fn into_response(self) -> ResponseParts {
        let mut response = ResponseParts {
            status: self.status,
            ..ResponseParts::default()
        };
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
            .headers
            .insert("x-content-type-options", HeaderValue::from_static("nosniff"));
        if let Some(realm) = self.realm {
            if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{realm}\"")) {
                response.headers.insert(PROXY_AUTHENTICATE, value);
            }
        }

        let mut body = BodyBuffer::default();
        body.push_bytes(self.message.as_bytes());
        body.push_bytes(b"\n");
        response.body = body;
        response
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::internal(format!("{err:#}"))
    }
}
