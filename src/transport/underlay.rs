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


use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{net::TcpStream, time::timeout};
use tracing::{debug, warn};

use super::{
    split_host_port, AddrError, BoxedStream, HostTable, IsdAsn, MultipathTransport, PathId,
    PathInfo, ScionAddr, TransportError,
};
use crate::config::TransportConfig;

/// Id of the path synthesized for destinations with no configured paths.
pub const IMPLICIT_PATH_ID: &str = "0";

/// Transport that addresses hosts through a SCION [`HostTable`] and carries connections over
/// the IP underlay toward the address's host component.
///
/// Paths are static: whatever the configuration lists per destination AS, in order, or a
/// single implicit path when nothing is listed.
#[derive(Debug)]
pub struct UnderlayTransport {
    hosts: HostTable,
    paths: HashMap<IsdAsn, Vec<PathInfo>>,
    dial_timeout: Duration,
}

impl UnderlayTransport {
    pub fn new(hosts: HostTable, dial_timeout: Duration) -> Self {
        Self {
            hosts,
            paths: HashMap::new(),
            dial_timeout,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let mut hosts = HostTable::new();
        for file in &config.hosts_files {
            hosts.load_file(file)?;
        }
        for (name, address) in &config.hosts {
            hosts
                .insert(name, address)
                .with_context(|| format!("invalid SCION address for host {name}"))?;
        }

        if hosts.is_empty() {
            debug!("no SCION hosts configured; every destination uses ordinary routing");
        } else {
            debug!(hosts = hosts.len(), "SCION host table loaded");
        }

        let mut transport = Self::new(hosts, Duration::from_millis(config.dial_timeout_ms));
        for path in &config.paths {
            let destination: IsdAsn = path
                .destination
                .parse()
                .with_context(|| format!("invalid path destination {}", path.destination))?;
            let hops = path
                .hops
                .iter()
                .map(|hop| hop.parse::<IsdAsn>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid hop list for path {}", path.id))?;
            transport.add_path(
                destination,
                PathInfo {
                    id: PathId::new(path.id.clone()),
                    hops,
                },
            );
        }
        Ok(transport)
    }

    pub fn add_path(&mut self, destination: IsdAsn, path: PathInfo) {
        self.paths.entry(destination).or_default().push(path);
    }
}

#[async_trait]
impl MultipathTransport for UnderlayTransport {
    async fn resolve_addr(&self, address: &str) -> Result<ScionAddr, AddrError> {
        if address.contains(',') {
            return ScionAddr::parse(address);
        }

        let (host, port) = split_host_port(address)?;
        let port = port.parse::<u16>().map_err(|_| AddrError::Invalid {
            input: address.to_string(),
            reason: "invalid port".to_string(),
        })?;

        match self.hosts.lookup(host) {
            Some((ia, ip)) => Ok(ScionAddr::new(ia, ip, port)),
            None => Err(AddrError::HostNotFound(host.to_string())),
        }
    }

    async fn paths(&self, dst: &ScionAddr) -> Result<Vec<PathInfo>, TransportError> {
        match self.paths.get(&dst.ia) {
            Some(paths) if !paths.is_empty() => Ok(paths.clone()),
            _ => Ok(vec![PathInfo {
                id: PathId::new(IMPLICIT_PATH_ID),
                hops: vec![dst.ia],
            }]),
        }
    }

    async fn dial(&self, dst: &ScionAddr, path: &PathInfo) -> Result<BoxedStream, TransportError> {
        debug!(%dst, path = %path.id, "dialing over underlay");
        match timeout(self.dial_timeout, TcpStream::connect(dst.underlay())).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            Ok(Err(source)) => {
                warn!(%dst, path = %path.id, error = %source, "underlay dial failed");
                Err(TransportError::Dial {
                    addr: *dst,
                    path: path.id.clone(),
                    source,
                })
            }
            Err(_) => Err(TransportError::DialTimeout {
                addr: *dst,
                path: path.id.clone(),
            }),
        }
    }
}
