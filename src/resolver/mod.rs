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


//! Host resolution: hostname → SCION address, optionally verified through the trusted local
//! resolver's authenticated TXT records.
//!
//! Every call runs its lookup on a dedicated worker task and races it against the resolve
//! timeout and the proxy's shutdown token. Nothing is cached.

mod dns;
mod error;

pub use dns::{TrustedDnsClient, TxtAnswer, DEFAULT_UDP_PAYLOAD};
pub use error::ResolveError;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::transport::{AddrError, MultipathTransport, ScionAddr};

const SCION_TXT_PREFIX: &str = "scion=";

/// How much of a resolution was cryptographically vouched for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub server_verified: bool,
    pub record_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub address: ScionAddr,
    pub verify: VerifyResult,
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    /// `Ok(None)` means the host has no SCION address and should use ordinary routing.
    async fn resolve(&self, host: &str) -> Result<Option<ScionAddr>, ResolveError>;

    async fn resolve_and_verify(&self, host: &str) -> Result<ResolvedAddress, ResolveError>;
}

/// Resolver backed by the multipath transport's addressing primitive and the trusted DNS
/// resolver.
#[derive(Debug, Clone)]
pub struct PathAwareResolver {
    transport: Arc<dyn MultipathTransport>,
    dns: TrustedDnsClient,
    timeout: Duration,
    cancel: CancellationToken,
}

impl PathAwareResolver {
    pub fn new(
        transport: Arc<dyn MultipathTransport>,
        dns: TrustedDnsClient,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            dns,
            timeout,
            cancel,
        }
    }

    /// Runs `work` on its own task and waits for whichever comes first: the deadline,
    /// cancellation, or the worker's result. A result arriving late is dropped with the
    /// receiver.
    async fn race<T, F>(&self, host: &str, work: F) -> Result<T, ResolveError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ResolveError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(work.await);
        });

        tokio::select! {
            _ = tokio::time::sleep(self.timeout) => {
                debug!(host, timeout_ms = self.timeout.as_millis() as u64, "resolution timed out");
                Err(ResolveError::Timeout)
            }
            _ = self.cancel.cancelled() => Err(ResolveError::Cancelled),
            result = rx => result.unwrap_or(Err(ResolveError::WorkerLost)),
        }
    }
}

#[async_trait]
impl HostResolver for PathAwareResolver {
    async fn resolve(&self, host: &str) -> Result<Option<ScionAddr>, ResolveError> {
        let transport = Arc::clone(&self.transport);
        let owned = host.to_string();
        self.race(host, async move { lookup(transport.as_ref(), &owned).await })
            .await
    }

    async fn resolve_and_verify(&self, host: &str) -> Result<ResolvedAddress, ResolveError> {
        let transport = Arc::clone(&self.transport);
        let dns = self.dns.clone();
        let owned = host.to_string();
        self.race(host, async move {
            verified_lookup(transport.as_ref(), &dns, &owned).await
        })
        .await
    }
}

/// Direct resolution with the single bogus-port retry.
async fn lookup(
    transport: &dyn MultipathTransport,
    host: &str,
) -> Result<Option<ScionAddr>, ResolveError> {
    let original = match transport.resolve_addr(host).await {
        Ok(addr) => {
            debug!(host, %addr, "SCION enabled");
            return Ok(Some(addr));
        }
        Err(AddrError::HostNotFound(_)) => {
            debug!(host, "SCION disabled");
            return Ok(None);
        }
        Err(err) => err,
    };

    // Usually "missing port"; the placeholder lets the address parser do the rest.
    match transport.resolve_addr(&format!("{host}:0")).await {
        Ok(addr) => {
            debug!(host, %addr, "SCION enabled");
            Ok(Some(addr))
        }
        Err(AddrError::HostNotFound(_)) => {
            debug!(host, "SCION disabled");
            Ok(None)
        }
        Err(_) => {
            error!(host, error = %original, "failed to resolve host");
            Err(ResolveError::Lookup(original))
        }
    }
}

async fn verified_lookup(
    transport: &dyn MultipathTransport,
    dns: &TrustedDnsClient,
    host: &str,
) -> Result<ResolvedAddress, ResolveError> {
    let answer = dns.lookup_txt(host).await?;
    if answer.records.is_empty() {
        return Err(ResolveError::NoAnswer);
    }

    let token = answer
        .records
        .iter()
        .find_map(|record| record.split_once(SCION_TXT_PREFIX).map(|(_, rest)| rest.trim()))
        .ok_or(ResolveError::NoScionRecord)?;

    let address = match transport.resolve_addr(token).await {
        Ok(addr) => addr,
        Err(AddrError::MissingPort(_)) => transport.resolve_addr(&format!("{token}:0")).await?,
        Err(err) => return Err(err.into()),
    };

    Ok(ResolvedAddress {
        address,
        verify: VerifyResult {
            server_verified: false,
            record_verified: answer.authenticated,
        },
    })
}
