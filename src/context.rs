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


//! Shared state handed to every connection and handler.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    auth::AuthGate,
    config::ProxyConfig,
    policy::{PolicyLanguage, PolicyStore, SequenceLanguage},
    proxy::{client::UpstreamClient, http1::Limits, target::Target},
    resolver::{HostResolver, PathAwareResolver, TrustedDnsClient},
    telemetry::TelemetrySink,
    tls,
    transport::{MultipathTransport, UnderlayTransport},
    utils::{ProxyError, ProxyResult},
};

/// Everything a request needs: the gate, policy store, resolver, transport and upstream
/// client. Built once by [`ContextBuilder::init`] and torn down with [`ProxyContext::teardown`].
pub struct ProxyContext {
    pub gate: AuthGate,
    pub policies: PolicyStore,
    pub resolver: Arc<dyn HostResolver>,
    pub transport: Arc<dyn MultipathTransport>,
    pub upstream: UpstreamClient,
    pub telemetry: TelemetrySink,
    api_prefix: String,
    request_limits: Limits,
    authorities: RwLock<Vec<String>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("api_prefix", &self.api_prefix)
            .field("authorities", &*self.authorities.read())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl ProxyContext {
    pub fn builder(config: ProxyConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    pub fn api_prefix(&self) -> &str {
        &self.api_prefix
    }

    /// Size caps for requests read from clients.
    pub fn request_limits(&self) -> Limits {
        self.request_limits
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Registers the bound listener address so requests aimed at it reach the management API.
    pub fn register_listener(&self, addr: SocketAddr) {
        let mut authorities = self.authorities.write();
        authorities.push(addr.to_string());
        if addr.ip().is_loopback() {
            authorities.push(format!("localhost:{}", addr.port()));
        }
    }

    /// Whether `target` addresses the proxy itself.
    pub fn is_self(&self, target: &Target) -> bool {
        self.authorities
            .read()
            .iter()
            .any(|authority| target.matches_authority(authority))
    }

    /// Cancels in-flight resolutions and tunnels and stops the accept loop.
    pub fn teardown(&self) {
        info!("tearing down proxy context");
        self.shutdown.cancel();
    }
}

/// Assembles a [`ProxyContext`] from configuration, with optional overrides for the pieces
/// tests and embedders swap out.
pub struct ContextBuilder {
    config: ProxyConfig,
    transport: Option<Arc<dyn MultipathTransport>>,
    language: Option<Arc<dyn PolicyLanguage>>,
    resolver: Option<Arc<dyn HostResolver>>,
}

impl ContextBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            transport: None,
            language: None,
            resolver: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn MultipathTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn policy_language(mut self, language: Arc<dyn PolicyLanguage>) -> Self {
        self.language = Some(language);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Allocates the policy store, builds transport and resolver, and probes the trusted
    /// resolver. A failed probe is fatal only with `resolver.require_trusted_resolver`.
    pub async fn init(self) -> ProxyResult<Arc<ProxyContext>> {
        let config = self.config;
        let shutdown = CancellationToken::new();

        let language = self.language.unwrap_or_else(|| Arc::new(SequenceLanguage));
        let policies = PolicyStore::new(language);
        let gate = AuthGate::new(&config.auth, policies.clone());

        let transport: Arc<dyn MultipathTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                UnderlayTransport::from_config(&config.transport)
                    .map_err(|err| ProxyError::Config(format!("{err:#}")))?,
            ),
        };

        let resolver: Arc<dyn HostResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => {
                let server: SocketAddr = config.resolver.trusted_resolver.parse().map_err(|_| {
                    ProxyError::Config(format!(
                        "resolver.trusted_resolver must be ip:port, got {:?}",
                        config.resolver.trusted_resolver
                    ))
                })?;
                let dns = TrustedDnsClient::new(server, config.resolver.udp_payload_size);
                probe_trusted_resolver(
                    &dns,
                    Duration::from_millis(config.resolver.probe_timeout_ms),
                    config.resolver.require_trusted_resolver,
                )
                .await?;
                Arc::new(PathAwareResolver::new(
                    Arc::clone(&transport),
                    dns,
                    Duration::from_millis(config.resolver.resolve_timeout_ms),
                    shutdown.child_token(),
                ))
            }
        };

        let client_tls = tls::upstream_client_config(config.upstream.ca_bundle.as_deref())
            .map_err(|err| ProxyError::Tls(format!("{err:#}")))?;

        Ok(Arc::new(ProxyContext {
            gate,
            policies,
            resolver,
            transport,
            upstream: UpstreamClient::new(&config.upstream, client_tls),
            telemetry: TelemetrySink::new(&config.telemetry),
            api_prefix: config.api.path_prefix.trim_end_matches('/').to_string(),
            request_limits: config.listener.request_limits(),
            authorities: RwLock::new(config.listener.authorities.clone()),
            shutdown,
        }))
    }
}

async fn probe_trusted_resolver(
    dns: &TrustedDnsClient,
    deadline: Duration,
    required: bool,
) -> ProxyResult<()> {
    let reason = match tokio::time::timeout(deadline, dns.probe()).await {
        Ok(Ok(())) => {
            info!(server = %dns.server(), "trusted resolver reachable");
            return Ok(());
        }
        Ok(Err(err)) => err.to_string(),
        Err(_) => format!("no response within {deadline:?}"),
    };

    if required {
        return Err(ProxyError::TrustedResolver {
            addr: dns.server().to_string(),
            reason,
        });
    }
    warn!(
        server = %dns.server(),
        %reason,
        "trusted resolver unreachable; verified resolution will fail until it is up"
    );
    Ok(())
}
