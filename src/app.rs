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

use anyhow::Result;

use crate::{
    config::{ProxyConfig, ProxyProtocol},
    context::ProxyContext,
    proxy::ProxyServer,
    tls::TlsIdentity,
};

/// Wires configuration, the shared [`ProxyContext`] and the listener together.
///
/// Initialization order: TLS identity first (so a bad certificate fails before anything is
/// bound), then the context (policy store, transport, resolver, upstream client), then the
/// listener.
pub struct ForwardProxyApp {
    ctx: Arc<ProxyContext>,
    server: ProxyServer,
}

impl ForwardProxyApp {
    pub async fn new(config: ProxyConfig) -> Result<Self> {
        let identity = match config.listener.proxy_protocol {
            ProxyProtocol::Tls => Some(TlsIdentity::load_or_generate(&config.tls)?),
            ProxyProtocol::Plain => None,
        };
        let listener = config.listener.clone();

        let ctx = ProxyContext::builder(config).init().await?;
        let server = ProxyServer::bind(Arc::clone(&ctx), &listener, identity.as_ref()).await?;

        Ok(Self { ctx, server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn context(&self) -> Arc<ProxyContext> {
        Arc::clone(&self.ctx)
    }

    /// Serves until Ctrl+C, then tears the context down so resolutions and tunnels stop.
    pub async fn run(self) -> Result<()> {
        let ctx = self.ctx;
        let server = tokio::spawn(self.server.run());

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");
        ctx.teardown();

        server.await??;
        Ok(())
    }
}
