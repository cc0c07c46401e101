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


//! Tunnel engine: authorize, classify, resolve, select a path, dial, then relay (CONNECT) or
//! forward (everything else). Requests addressed to the proxy itself go to the management
//! API instead.

use anyhow::Result;
use http::{header::HOST, Method};
use tracing::{debug, info, warn};

use super::{
    flow::{Flow, ResponseParts},
    leg::{ClientLeg, Disposition},
    target::Target,
};
use crate::{
    api,
    context::ProxyContext,
    transport::BoxedStream,
    utils::HandlerError,
};

/// Serves one request on `leg` and reports whether the connection can carry another.
pub async fn serve(ctx: &ProxyContext, flow: &mut Flow, mut leg: ClientLeg<'_>) -> Result<Disposition> {
    flow.metadata.client_protocol = Some(leg.protocol());

    let outcome = if is_management_request(ctx, flow) {
        serve_management(ctx, flow).await
    } else {
        match ctx.gate.authenticate(&flow.request.headers) {
            Ok(identity) => {
                flow.metadata.identity = Some(identity.clone());
                if flow.request.method == Method::CONNECT {
                    return serve_tunnel(ctx, flow, leg, &identity).await;
                }
                serve_forward(ctx, flow, &identity).await
            }
            Err(err) => {
                debug!(error = %err, uri = %flow.request.uri, "proxy request not authorized");
                Err(HandlerError::proxy_auth_required(ctx.gate.realm()))
            }
        }
    };

    let response = outcome.unwrap_or_else(HandlerError::into_response);
    flow.metadata.status = Some(response.status.as_u16());
    flow.metadata.bytes_down = response.body.len() as u64;
    let sent = leg.send_response(&response).await;
    ctx.telemetry.emit_flow(flow);
    sent?;
    Ok(Disposition::KeepAlive)
}

/// A request is for the proxy itself when it names one of the proxy's authorities, or when
/// it is origin-form with no `Host` at all.
fn is_management_request(ctx: &ProxyContext, flow: &Flow) -> bool {
    let request = &flow.request;
    if request.method == Method::CONNECT {
        return false;
    }
    if request.uri.authority().is_none() && !request.headers.contains_key(HOST) {
        return true;
    }
    match Target::from_forward(request) {
        Ok(target) => ctx.is_self(&target),
        Err(_) => false,
    }
}

async fn serve_management(
    ctx: &ProxyContext,
    flow: &mut Flow,
) -> Result<ResponseParts, HandlerError> {
    flow.metadata.route = Some("api");
    let identity = ctx
        .gate
        .identify_for_api(&flow.request.headers)
        .map_err(|_| HandlerError::proxy_auth_required(ctx.gate.realm()))?;
    flow.metadata.identity = Some(identity.clone());
    api::handle(ctx, &identity, &flow.request).await
}

async fn serve_forward(
    ctx: &ProxyContext,
    flow: &mut Flow,
    identity: &str,
) -> Result<ResponseParts, HandlerError> {
    let target = Target::from_forward(&flow.request)?;
    flow.metadata.target = Some(target.to_string());
    let stream = dial(ctx, flow, identity, &target).await?;

    flow.metadata.bytes_up = flow.request.body.len() as u64;
    let forwarded = ctx
        .upstream
        .forward(stream, &target, &flow.request)
        .await
        .map_err(|err| {
            warn!(%target, error = %format!("{err:#}"), "forwarding failed");
            HandlerError::bad_gateway(format!("{err:#}"))
        })?;
    flow.metadata.upstream_protocol = Some(forwarded.protocol);
    Ok(forwarded.response)
}

async fn serve_tunnel(
    ctx: &ProxyContext,
    flow: &mut Flow,
    mut leg: ClientLeg<'_>,
    identity: &str,
) -> Result<Disposition> {
    let dialed = match Target::from_connect(&flow.request.uri) {
        Ok(target) => {
            flow.metadata.target = Some(target.to_string());
            dial(ctx, flow, identity, &target).await
        }
        Err(err) => Err(err),
    };

    let mut upstream = match dialed {
        Ok(stream) => stream,
        Err(err) => {
            let response = err.into_response();
            flow.metadata.status = Some(response.status.as_u16());
            let sent = leg.send_response(&response).await;
            ctx.telemetry.emit_flow(flow);
            sent?;
            return Ok(Disposition::KeepAlive);
        }
    };

    flow.metadata.status = Some(200);
    flow.metadata.upstream_protocol = Some("tunnel");
    let client = leg.establish_tunnel().await?;
    let shutdown = ctx.shutdown_token();

    tokio::select! {
        result = client.relay(&mut upstream) => match result {
            Ok((up, down)) => {
                flow.metadata.bytes_up = up;
                flow.metadata.bytes_down = down;
            }
            Err(err) => debug!(error = %err, "tunnel relay ended with error"),
        },
        _ = shutdown.cancelled() => debug!("tunnel closed by shutdown"),
    }

    ctx.telemetry.emit_flow(flow);
    Ok(Disposition::Close)
}

/// Resolves the target, applies the caller's path policy and dials. Hosts without a SCION
/// address are dialed over ordinary routing and record no path usage.
async fn dial(
    ctx: &ProxyContext,
    flow: &mut Flow,
    identity: &str,
    target: &Target,
) -> Result<BoxedStream, HandlerError> {
    let resolved = ctx.resolver.resolve(&target.host).await.map_err(|err| {
        info!(host = %target.host, error = %err, "resolution failed");
        HandlerError::service_unavailable(err.to_string())
    })?;

    let Some(address) = resolved else {
        flow.metadata.route = Some("ip");
        return ctx.upstream.connect_ordinary(target).await.map_err(|err| {
            warn!(%target, error = %format!("{err:#}"), "ordinary dial failed");
            HandlerError::bad_gateway(format!("{err:#}"))
        });
    };

    let address = address.with_port(target.port);
    flow.metadata.route = Some("scion");
    flow.metadata.scion_address = Some(address.to_string());

    let paths = ctx
        .transport
        .paths(&address)
        .await
        .map_err(|err| HandlerError::bad_gateway(err.to_string()))?;
    let selector = ctx.policies.selector(identity);
    let path = selector.select(&paths).cloned().ok_or_else(|| {
        info!(identity, %address, candidates = paths.len(), "policy permits no path");
        HandlerError::bad_gateway(format!("no path to {address} permitted by policy"))
    })?;

    let stream = ctx
        .transport
        .dial(&address, &path)
        .await
        .map_err(|err| HandlerError::bad_gateway(err.to_string()))?;

    ctx.policies.record_path_usage(identity, &path.id);
    flow.metadata.path_id = Some(path.id.to_string());
    debug!(identity, %address, path = %path.id, "dialed over SCION path");
    Ok(stream)
}
