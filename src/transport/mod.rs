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


//! SCION addressing and the multipath transport seam.
//!
//! The proxy never speaks the SCION dataplane itself. It needs three primitives from the
//! transport: turn a textual address into a [`ScionAddr`], list the paths toward a destination,
//! and dial one of those paths. [`MultipathTransport`] captures exactly that, and
//! [`UnderlayTransport`] is the implementation wired in by default.

mod hosts;
mod underlay;

pub use hosts::HostTable;
pub use underlay::{UnderlayTransport, IMPLICIT_PATH_ID};

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream the proxy can relay or speak HTTP over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Failures from the addressing primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddrError {
    /// The host has no SCION address. Callers treat this as "use ordinary routing".
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("missing port in address {0:?}")]
    MissingPort(String),

    #[error("invalid address {input:?}: {reason}")]
    Invalid { input: String, reason: String },
}

impl AddrError {
    fn invalid(input: &str, reason: impl Into<String>) -> Self {
        AddrError::Invalid {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no paths to {0}")]
    NoPaths(ScionAddr),

    #[error("dial to {addr} over path {path} timed out")]
    DialTimeout { addr: ScionAddr, path: PathId },

    #[error("dial to {addr} over path {path} failed: {source}")]
    Dial {
        addr: ScionAddr,
        path: PathId,
        #[source]
        source: std::io::Error,
    },
}

/// ISD-AS pair identifying a SCION autonomous system, e.g. `1-ff00:0:110`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsdAsn {
    pub isd: u16,
    pub asn: u64,
}

const MAX_BGP_ASN: u64 = u32::MAX as u64;
const MAX_ASN: u64 = (1 << 48) - 1;

impl IsdAsn {
    pub const fn new(isd: u16, asn: u64) -> Self {
        Self { isd, asn }
    }
}

impl fmt::Display for IsdAsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.asn <= MAX_BGP_ASN {
            write!(f, "{}-{}", self.isd, self.asn)
        } else {
            write!(
                f,
                "{}-{:x}:{:x}:{:x}",
                self.isd,
                (self.asn >> 32) & 0xffff,
                (self.asn >> 16) & 0xffff,
                self.asn & 0xffff
            )
        }
    }
}

impl FromStr for IsdAsn {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (isd, asn) = s
            .split_once('-')
            .ok_or_else(|| AddrError::invalid(s, "expected <isd>-<as>"))?;
        let isd = isd
            .parse::<u16>()
            .map_err(|_| AddrError::invalid(s, "ISD is not a 16-bit number"))?;

        let asn = if asn.contains(':') {
            let groups: Vec<&str> = asn.split(':').collect();
            if groups.len() != 3 {
                return Err(AddrError::invalid(s, "AS must have three hex groups"));
            }
            let mut value = 0u64;
            for group in groups {
                let part = u16::from_str_radix(group, 16)
                    .map_err(|_| AddrError::invalid(s, "AS group is not 16-bit hex"))?;
                value = (value << 16) | part as u64;
            }
            value
        } else {
            let value = asn
                .parse::<u64>()
                .map_err(|_| AddrError::invalid(s, "AS is not a number"))?;
            if value > MAX_BGP_ASN {
                return Err(AddrError::invalid(s, "decimal AS outside the BGP range"));
            }
            value
        };

        if asn > MAX_ASN {
            return Err(AddrError::invalid(s, "AS exceeds 48 bits"));
        }
        Ok(Self { isd, asn })
    }
}

/// A SCION host address: ISD-AS, host IP and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScionAddr {
    pub ia: IsdAsn,
    pub host: IpAddr,
    pub port: u16,
}

impl ScionAddr {
    pub fn new(ia: IsdAsn, host: IpAddr, port: u16) -> Self {
        Self { ia, host, port }
    }

    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    /// Underlay socket address of the host component.
    pub fn underlay(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Parses `<ia>,<host>:<port>`; the port is mandatory.
    pub fn parse(input: &str) -> Result<Self, AddrError> {
        let (ia, rest) = input
            .split_once(',')
            .ok_or_else(|| AddrError::invalid(input, "expected <ia>,<host>:<port>"))?;
        let ia = ia.trim().parse::<IsdAsn>()?;
        let (host, port) = split_host_port(rest.trim())?;
        let host = parse_host_ip(input, host)?;
        let port = parse_port(input, port)?;
        Ok(Self { ia, host, port })
    }

    /// Parses `<ia>,[<ip>]` or `<ia>,<ip>` without a port, as used by hosts files.
    pub fn parse_host(input: &str) -> Result<(IsdAsn, IpAddr), AddrError> {
        let (ia, host) = input
            .split_once(',')
            .ok_or_else(|| AddrError::invalid(input, "expected <ia>,<host>"))?;
        let ia = ia.trim().parse::<IsdAsn>()?;
        let host = host.trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Ok((ia, parse_host_ip(input, host)?))
    }
}

impl fmt::Display for ScionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},[{}]:{}", self.ia, self.host, self.port)
    }
}

impl FromStr for ScionAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Splits `host:port` or `[host]:port` the way `net.SplitHostPort` does. A missing port is
/// reported as [`AddrError::MissingPort`] so callers can retry with a placeholder port.
pub fn split_host_port(input: &str) -> Result<(&str, &str), AddrError> {
    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| AddrError::invalid(input, "missing ']'"))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, port)),
            None if tail.is_empty() => Err(AddrError::MissingPort(input.to_string())),
            None => Err(AddrError::invalid(input, "unexpected text after ']'")),
        };
    }

    match input.rsplit_once(':') {
        None => Err(AddrError::MissingPort(input.to_string())),
        Some((host, _)) if host.contains(':') => {
            Err(AddrError::invalid(input, "too many colons"))
        }
        Some((host, port)) => Ok((host, port)),
    }
}

fn parse_host_ip(input: &str, host: &str) -> Result<IpAddr, AddrError> {
    host.parse::<IpAddr>()
        .map_err(|_| AddrError::invalid(input, "host is not an IP address"))
}

fn parse_port(input: &str, port: &str) -> Result<u16, AddrError> {
    port.parse::<u16>()
        .map_err(|_| AddrError::invalid(input, "invalid port"))
}

/// Identifier of a concrete path, as referenced by policy rules (`"+ 42"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(String);

impl PathId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PathId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One path toward a destination AS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub id: PathId,
    /// ASes traversed, source first.
    pub hops: Vec<IsdAsn>,
}

/// Addressing and dial primitives of the multipath transport.
#[async_trait]
pub trait MultipathTransport: Send + Sync + fmt::Debug {
    /// Resolves a textual address to a SCION address.
    ///
    /// Accepts literal SCION addresses and `host:port` names. A name without a port yields
    /// [`AddrError::MissingPort`]; a name without a SCION address yields
    /// [`AddrError::HostNotFound`].
    async fn resolve_addr(&self, address: &str) -> Result<ScionAddr, AddrError>;

    /// Paths toward `dst` in the transport's preference order.
    async fn paths(&self, dst: &ScionAddr) -> Result<Vec<PathInfo>, TransportError>;

    async fn dial(&self, dst: &ScionAddr, path: &PathInfo) -> Result<BoxedStream, TransportError>;
}
