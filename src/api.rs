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


//! Management API served to requests addressed to the proxy itself.
//!
//! `/policy` (GET, PUT), `/path-usage` (GET), `/redirect` (GET) and `/resolve` (GET), all
//! under the configured path prefix.

use http::{
    header::{CONTENT_TYPE, LOCATION},
    HeaderValue, Method, StatusCode,
};
use serde_json::json;
use tracing::{debug, info};

use crate::{
    context::ProxyContext,
    policy::PolicyStore,
    proxy::flow::{BodyBuffer, RequestParts, ResponseParts},
    resolver::ResolveError,
    utils::HandlerError,
};

pub const POLICY_PATH: &str = "/policy";
pub const PATH_USAGE_PATH: &str = "/path-usage";
pub const REDIRECT_PATH: &str = "/redirect";
pub const RESOLVE_PATH: &str = "/resolve";

/// Dispatches a management request. `identity` is the caller as derived by
/// [`crate::auth::AuthGate::identify_for_api`].
pub async fn handle(
    ctx: &ProxyContext,
    identity: &str,
    request: &RequestParts,
) -> Result<ResponseParts, HandlerError> {
    let path = request.uri.path();
    let Some(route) = path.strip_prefix(ctx.api_prefix()) else {
        return Err(HandlerError::not_found());
    };

    match route {
        POLICY_PATH => handle_policy(ctx, identity, request),
        PATH_USAGE_PATH => handle_path_usage(ctx, identity, request),
        REDIRECT_PATH => handle_redirect(ctx, request).await,
        RESOLVE_PATH => handle_resolve(ctx, request).await,
        _ => Err(HandlerError::not_found()),
    }
}

fn handle_policy(
    ctx: &ProxyContext,
    identity: &str,
    request: &RequestParts,
) -> Result<ResponseParts, HandlerError> {
    match request.method {
        Method::PUT => {
            let rules = PolicyStore::parse_document(request.body.as_bytes())
                .map_err(|err| HandlerError::bad_request(err.to_string()))?;
            ctx.policies
                .set_policy(identity, rules)
                .map_err(|err| HandlerError::bad_request(err.to_string()))?;
            info!(identity, "policy updated");
            Ok(ResponseParts::empty(StatusCode::OK))
        }
        Method::GET => json_response(&json!(ctx.policies.get_policy(identity))),
        _ => Err(HandlerError::method_not_allowed(
            "HTTP GET and PUT allowed only",
        )),
    }
}

fn handle_path_usage(
    ctx: &ProxyContext,
    identity: &str,
    request: &RequestParts,
) -> Result<ResponseParts, HandlerError> {
    require_get(request)?;
    json_response(&json!(ctx.policies.path_usage(identity)))
}

async fn handle_redirect(
    ctx: &ProxyContext,
    request: &RequestParts,
) -> Result<ResponseParts, HandlerError> {
    require_get(request)?;
    let raw = single_param(request, "url").ok_or_else(|| {
        HandlerError::bad_request("URL parameter 'url' must contain exactly one value")
    })?;

    let url = url::Url::parse(&raw).map_err(|err| HandlerError::bad_request(err.to_string()))?;
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(HandlerError::bad_request("URL has no host")),
    };

    debug!(url = %url, "resolving redirect target");
    match ctx.resolver.resolve(&host).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(url = %url, "redirect target has no SCION address");
            return Err(HandlerError::service_unavailable(format!(
                "{host} has no SCION address"
            )));
        }
        Err(err) => {
            info!(url = %url, error = %err, "failed to resolve redirect target");
            return Err(HandlerError::service_unavailable(err.to_string()));
        }
    }

    let location = HeaderValue::from_str(url.as_str())
        .map_err(|_| HandlerError::bad_request("URL is not a valid Location value"))?;
    let mut response = ResponseParts::empty(StatusCode::MOVED_PERMANENTLY);
    response
        .headers
        .insert("access-control-allow-origin", HeaderValue::from_static("*"));
    response.headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type"),
    );
    response.headers.insert(LOCATION, location);
    response.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response.body = BodyBuffer::from(
        format!("<a href=\"{}\">Moved Permanently</a>.\n\n", html_escape(url.as_str())).as_bytes(),
    );
    info!(redirect = %url, "redirecting");
    Ok(response)
}

async fn handle_resolve(
    ctx: &ProxyContext,
    request: &RequestParts,
) -> Result<ResponseParts, HandlerError> {
    require_get(request)?;
    let hosts = query_values(request, "host");
    if hosts.len() != 1 {
        return Err(HandlerError::bad_request(
            "URL parameter 'host' must contain exactly one value",
        ));
    }

    match ctx.resolver.resolve_and_verify(&hosts[0]).await {
        Ok(resolved) => json_response(&json!({
            "address": resolved.address.to_string(),
            "serverVerified": resolved.verify.server_verified,
            "recordVerified": resolved.verify.record_verified,
        })),
        Err(err) if err.is_absent_record() => {
            debug!(host = %hosts[0], error = %err, "no SCION record; empty answer");
            Ok(ResponseParts::empty(StatusCode::OK))
        }
        Err(ResolveError::Lookup(err)) if is_not_found(&err) => {
            Ok(ResponseParts::empty(StatusCode::OK))
        }
        Err(err) => Err(HandlerError::internal(err.to_string())),
    }
}

fn is_not_found(err: &crate::transport::AddrError) -> bool {
    matches!(err, crate::transport::AddrError::HostNotFound(_))
}

fn require_get(request: &RequestParts) -> Result<(), HandlerError> {
    if request.method == Method::GET {
        Ok(())
    } else {
        Err(HandlerError::method_not_allowed("HTTP GET allowed only"))
    }
}

fn query_values(request: &RequestParts, key: &str) -> Vec<String> {
    let query = request.uri.query().unwrap_or("");
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
        .collect()
}

fn single_param(request: &RequestParts, key: &str) -> Option<String> {
    let mut values = query_values(request, key);
    if values.len() == 1 {
        values.pop()
    } else {
        None
    }
}

fn json_response(value: &serde_json::Value) -> Result<ResponseParts, HandlerError> {
    let mut body = serde_json::to_vec(value).map_err(|err| HandlerError::internal(err.to_string()))?;
    body.push(b'\n');
    let mut response = ResponseParts::empty(StatusCode::OK);
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response.body = BodyBuffer::from(body.as_slice());
    Ok(response)
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
