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
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::proxy::http1::Limits;

/// Configuration loaders and structures for the forward proxy.
///
/// These types mirror `proxy.example.toml`. Every section has defaults so a config can be
/// built in code (tests do) or from a partial file. Relative paths are resolved beside the
/// config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl ProxyConfig {
    /// Reads the config file, deserializes TOML, and normalizes relative paths.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut cfg: ProxyConfig = toml::from_str(&raw)
            .with_context(|| format!("invalid proxy config: {}", path.display()))?;

        let base_dir = path.parent();
        Self::absolutize(base_dir, &mut cfg.tls.cert_path);
        Self::absolutize(base_dir, &mut cfg.tls.key_path);
        for file in &mut cfg.transport.hosts_files {
            Self::absolutize(base_dir, file);
        }
        if let Some(bundle) = cfg.upstream.ca_bundle.as_mut() {
            Self::absolutize(base_dir, bundle);
        }

        Ok(cfg)
    }

    fn absolutize(base_dir: Option<&Path>, target: &mut PathBuf) {
        if target.is_relative() {
            if let Some(dir) = base_dir {
                *target = dir.join(&*target);
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// `0` picks an ephemeral port.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default)]
    pub proxy_protocol: ProxyProtocol,
    /// Extra `host[:port]` names that address the proxy itself (management API). The bound
    /// socket address is always included.
    #[serde(default)]
    pub authorities: Vec<String>,
    /// Cap on a client request's start line plus headers.
    #[serde(default = "default_max_head_bytes")]
    pub max_header_bytes: usize,
    /// Cap on a buffered client request body (413 beyond it).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            proxy_protocol: ProxyProtocol::default(),
            authorities: Vec::new(),
            max_header_bytes: default_max_head_bytes(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ListenerConfig {
    pub fn request_limits(&self) -> Limits {
        Limits {
            max_head_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

fn default_max_head_bytes() -> usize {
    crate::proxy::http1::DEFAULT_MAX_HEAD_BYTES
}

fn default_max_body_bytes() -> usize {
    crate::proxy::http1::DEFAULT_MAX_BODY_BYTES
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_bind_port() -> u16 {
    8443
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// Terminate TLS before parsing HTTP (ALPN picks h2 or HTTP/1.1).
    #[default]
    Tls,
    /// Cleartext HTTP/1.1, or HTTP/2 with prior knowledge.
    Plain,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Write a self-signed identity to the paths above when they don't exist.
    #[serde(default = "default_true")]
    pub generate_if_missing: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            generate_if_missing: true,
        }
    }
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("certs/proxy.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("certs/proxy.key")
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    /// Separates the secret from an inline policy payload inside the Basic password.
    #[serde(default = "default_policy_marker")]
    pub policy_marker: String,
    /// Apply inline policy payloads. When off they are parsed out and ignored.
    #[serde(default)]
    pub inline_policy: bool,
    #[serde(default = "default_realm")]
    pub realm: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            policy_marker: default_policy_marker(),
            inline_policy: false,
            realm: default_realm(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    pub user: String,
    #[serde(default)]
    pub secret: String,
}

fn default_policy_marker() -> String {
    "caddy-scion-forward-proxy=".into()
}

fn default_realm() -> String {
    "scion-forward-proxy".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_trusted_resolver")]
    pub trusted_resolver: String,
    #[serde(default = "default_udp_payload_size")]
    pub udp_payload_size: u16,
    /// Refuse to start when the startup probe of the trusted resolver fails.
    #[serde(default)]
    pub require_trusted_resolver: bool,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: default_resolve_timeout_ms(),
            trusted_resolver: default_trusted_resolver(),
            udp_payload_size: default_udp_payload_size(),
            require_trusted_resolver: false,
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

fn default_resolve_timeout_ms() -> u64 {
    10_000
}

fn default_trusted_resolver() -> String {
    "127.0.0.1:5553".into()
}

fn default_udp_payload_size() -> u16 {
    crate::resolver::DEFAULT_UDP_PAYLOAD
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// SCION hosts files (`<ia>,[<ip>] name…`).
    #[serde(default)]
    pub hosts_files: Vec<PathBuf>,
    /// Inline host entries: name → `<ia>,[<ip>]`.
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    #[serde(default)]
    pub paths: Vec<PathConfig>,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hosts_files: Vec::new(),
            hosts: BTreeMap::new(),
            paths: Vec::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathConfig {
    /// Destination ISD-AS.
    pub destination: String,
    pub id: String,
    #[serde(default)]
    pub hops: Vec<String>,
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Protocol for cleartext origins. TLS origins negotiate through ALPN.
    #[serde(default)]
    pub protocol: UpstreamProtocol,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Extra PEM roots trusted for TLS origins, on top of the webpki set.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
    /// Cap on a buffered origin response body; larger responses fail with 502.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            protocol: UpstreamProtocol::default(),
            response_timeout_ms: default_response_timeout_ms(),
            ca_bundle: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl UpstreamConfig {
    pub fn response_limits(&self) -> Limits {
        Limits {
            max_body_bytes: self.max_body_bytes,
            ..Limits::default()
        }
    }
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    #[default]
    Http1,
    /// HTTP/2 with prior knowledge.
    H2,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Prefix in front of `/policy`, `/path-usage`, `/redirect` and `/resolve`.
    #[serde(default)]
    pub path_prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub mode: TelemetryMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Human-readable events through `tracing`.
    #[default]
    Stdout,
    /// One JSON object per flow on stdout.
    Json,
}
