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

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::{config::ListenerConfig, context::ProxyContext, tls::TlsIdentity};

use super::connection::handle_connection;

/// Owns the listening socket and spawns one task per accepted client.
///
/// Binding happens in [`ProxyServer::bind`] so callers (and tests binding port 0) learn the
/// real address before the accept loop starts. The bound address is registered with the
/// context so requests aimed at it reach the management API.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    /// Binds the configured address. `identity` is required for a TLS listener and ignored
    /// for a plaintext one.
    pub async fn bind(
        ctx: Arc<ProxyContext>,
        cfg: &ListenerConfig,
        identity: Option<&TlsIdentity>,
    ) -> Result<Self> {
        let ip: IpAddr = cfg
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address {:?}", cfg.bind_address))?;
        let listener = TcpListener::bind(SocketAddr::new(ip, cfg.bind_port))
            .await
            .with_context(|| format!("failed to bind {}:{}", cfg.bind_address, cfg.bind_port))?;
        let local_addr = listener.local_addr()?;
        ctx.register_listener(local_addr);

        let acceptor = match identity {
            Some(identity) => Some(TlsAcceptor::from(identity.server_config()?)),
            None => None,
        };

        tracing::info!(
            %local_addr,
            tls = acceptor.is_some(),
            "forward proxy listener online"
        );

        Ok(Self {
            listener,
            local_addr,
            acceptor,
            ctx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Returns once the context shuts down; connection errors are logged and
    /// never stop the listener.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.ctx.shutdown_token();
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };
            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };

            let ctx = Arc::clone(&self.ctx);
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, peer, ctx, acceptor).await {
                    tracing::warn!(%peer, "connection error: {err:?}");
                }
            });
        }

        tracing::info!(local_addr = %self.local_addr, "forward proxy listener stopped");
        Ok(())
    }
}
