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


mod common;

use std::{collections::HashMap, net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use scion_forward_proxy::{
    resolver::{HostResolver, PathAwareResolver, ResolveError, TrustedDnsClient},
    transport::{
        split_host_port, AddrError, BoxedStream, IsdAsn, MultipathTransport, PathInfo, ScionAddr,
        TransportError,
    },
};
use tokio_util::sync::CancellationToken;

use common::{spawn_fake_dns, spawn_slow_fake_dns, FakeTxt};

/// Addressing-only transport that records every address it is asked to resolve.
#[derive(Debug, Default)]
struct FakeTransport {
    known: HashMap<String, ScionAddr>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl FakeTransport {
    fn with_host(mut self, name: &str, addr: ScionAddr) -> Self {
        self.known.insert(name.to_string(), addr);
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MultipathTransport for FakeTransport {
    async fn resolve_addr(&self, address: &str) -> Result<ScionAddr, AddrError> {
        self.calls.lock().push(address.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if address.contains(',') {
            return ScionAddr::parse(address);
        }
        let (host, port) = split_host_port(address)?;
        let port: u16 = port.parse().map_err(|_| AddrError::Invalid {
            input: address.to_string(),
            reason: "invalid port".into(),
        })?;
        self.known
            .get(host)
            .map(|addr| addr.with_port(port))
            .ok_or_else(|| AddrError::HostNotFound(host.to_string()))
    }

    async fn paths(&self, dst: &ScionAddr) -> Result<Vec<PathInfo>, TransportError> {
        Err(TransportError::NoPaths(*dst))
    }

    async fn dial(&self, dst: &ScionAddr, _path: &PathInfo) -> Result<BoxedStream, TransportError> {
        Err(TransportError::NoPaths(*dst))
    }
}

fn scion_addr() -> ScionAddr {
    let ia: IsdAsn = "1-ff00:0:110".parse().expect("ia");
    ScionAddr::new(ia, IpAddr::from([127, 0, 0, 1]), 443)
}

fn resolver(
    transport: Arc<FakeTransport>,
    dns: std::net::SocketAddr,
    timeout: Duration,
) -> (PathAwareResolver, CancellationToken) {
    let cancel = CancellationToken::new();
    let resolver = PathAwareResolver::new(
        transport,
        TrustedDnsClient::new(dns, 2048),
        timeout,
        cancel.clone(),
    );
    (resolver, cancel)
}

fn unused_dns() -> std::net::SocketAddr {
    "127.0.0.1:9".parse().expect("addr")
}

#[tokio::test]
async fn portless_host_is_retried_with_placeholder_port() {
    let transport = Arc::new(FakeTransport::default().with_host("scion.test", scion_addr()));
    let (resolver, _) = resolver(Arc::clone(&transport), unused_dns(), Duration::from_secs(2));

    let resolved = resolver
        .resolve("scion.test")
        .await
        .expect("resolves")
        .expect("has SCION address");
    assert_eq!(resolved.ia, scion_addr().ia);
    assert_eq!(resolved.port, 0);
    assert_eq!(transport.calls(), vec!["scion.test", "scion.test:0"]);
}

#[tokio::test]
async fn host_with_port_resolves_in_one_call() {
    let transport = Arc::new(FakeTransport::default().with_host("scion.test", scion_addr()));
    let (resolver, _) = resolver(Arc::clone(&transport), unused_dns(), Duration::from_secs(2));

    let resolved = resolver.resolve("scion.test:8443").await.expect("resolves");
    assert_eq!(resolved.map(|a| a.port), Some(8443));
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn unknown_host_means_ordinary_routing() {
    let transport = Arc::new(FakeTransport::default());
    let (resolver, _) = resolver(Arc::clone(&transport), unused_dns(), Duration::from_secs(2));

    assert_eq!(resolver.resolve("example.org").await.expect("no error"), None);
    assert_eq!(resolver.resolve("example.org:80").await.expect("no error"), None);
}

#[tokio::test]
async fn hard_failure_surfaces_the_first_error() {
    let transport = Arc::new(FakeTransport::default());
    let (resolver, _) = resolver(Arc::clone(&transport), unused_dns(), Duration::from_secs(2));

    let err = resolver
        .resolve("1-ff00:0:110,bogus")
        .await
        .expect_err("unparseable address");
    assert!(
        matches!(err, ResolveError::Lookup(AddrError::MissingPort(ref input)) if input == "bogus"),
        "unexpected error: {err:?}"
    );
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test]
async fn slow_lookup_times_out() {
    let transport = Arc::new(
        FakeTransport::default()
            .with_host("scion.test", scion_addr())
            .slow(Duration::from_secs(5)),
    );
    let (resolver, _) = resolver(transport, unused_dns(), Duration::from_millis(50));

    let err = resolver.resolve("scion.test:443").await.expect_err("deadline");
    assert!(matches!(err, ResolveError::Timeout));
    assert_eq!(err.to_string(), "resolve timeout");
}

#[tokio::test]
async fn slow_trusted_resolver_times_out_verified_resolution() {
    let dns = spawn_slow_fake_dns(
        HashMap::from([(
            "scion.test".to_string(),
            FakeTxt {
                records: vec!["scion=1-ff00:0:110,[127.0.0.1]".into()],
                authenticated: true,
            },
        )]),
        Duration::from_secs(5),
    )
    .await;
    let (resolver, _) = resolver(Arc::new(FakeTransport::default()), dns, Duration::from_millis(100));

    let started = std::time::Instant::now();
    let err = resolver
        .resolve_and_verify("scion.test")
        .await
        .expect_err("deadline");
    assert!(matches!(err, ResolveError::Timeout), "unexpected error: {err:?}");
    assert_eq!(err.to_string(), "resolve timeout");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn cancellation_aborts_pending_lookup() {
    let transport = Arc::new(FakeTransport::default().slow(Duration::from_secs(5)));
    let (resolver, cancel) = resolver(transport, unused_dns(), Duration::from_secs(10));

    let pending = tokio::spawn(async move { resolver.resolve("scion.test:443").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = pending.await.expect("task joined");
    assert!(matches!(result, Err(ResolveError::Cancelled)));
}

#[tokio::test]
async fn verified_resolution_reads_scion_txt_record() {
    let dns = spawn_fake_dns(HashMap::from([(
        "scion.test".to_string(),
        FakeTxt {
            records: vec![
                "v=spf1 -all".into(),
                "scion=1-ff00:0:110,[127.0.0.1]".into(),
            ],
            authenticated: true,
        },
    )]))
    .await;
    let transport = Arc::new(FakeTransport::default());
    let (resolver, _) = resolver(transport, dns, Duration::from_secs(2));

    let resolved = resolver
        .resolve_and_verify("scion.test")
        .await
        .expect("verified resolution");
    assert_eq!(resolved.address.to_string(), "1-ff00:0:110,[127.0.0.1]:0");
    assert!(resolved.verify.record_verified);
    assert!(!resolved.verify.server_verified);
}

#[tokio::test]
async fn unauthenticated_answer_is_not_record_verified() {
    let dns = spawn_fake_dns(HashMap::from([(
        "scion.test".to_string(),
        FakeTxt {
            records: vec!["scion=1-ff00:0:110,[127.0.0.1]:8443".into()],
            authenticated: false,
        },
    )]))
    .await;
    let (resolver, _) = resolver(Arc::new(FakeTransport::default()), dns, Duration::from_secs(2));

    let resolved = resolver
        .resolve_and_verify("scion.test")
        .await
        .expect("resolution");
    assert_eq!(resolved.address.port, 8443);
    assert!(!resolved.verify.record_verified);
}

#[tokio::test]
async fn missing_records_are_reported_distinctly() {
    let dns = spawn_fake_dns(HashMap::from([(
        "plain.test".to_string(),
        FakeTxt {
            records: vec!["v=spf1 -all".into()],
            authenticated: true,
        },
    )]))
    .await;
    let (resolver, _) = resolver(Arc::new(FakeTransport::default()), dns, Duration::from_secs(2));

    let err = resolver
        .resolve_and_verify("unknown.test")
        .await
        .expect_err("no answer");
    assert!(matches!(err, ResolveError::NoAnswer));
    assert_eq!(err.to_string(), "no answer");

    let err = resolver
        .resolve_and_verify("plain.test")
        .await
        .expect_err("no scion record");
    assert!(matches!(err, ResolveError::NoScionRecord));
    assert!(err.is_absent_record());
}

#[tokio::test]
async fn dns_client_returns_txt_strings_and_ad_flag() {
    let dns = spawn_fake_dns(HashMap::from([(
        "scion.test".to_string(),
        FakeTxt {
            records: vec!["scion=1-ff00:0:110,[10.0.0.1]".into()],
            authenticated: true,
        },
    )]))
    .await;
    let client = TrustedDnsClient::new(dns, 2048);

    let answer = client.lookup_txt("scion.test").await.expect("answer");
    assert_eq!(answer.records, vec!["scion=1-ff00:0:110,[10.0.0.1]"]);
    assert!(answer.authenticated);

    let probe = tokio::time::timeout(Duration::from_secs(2), client.probe()).await;
    assert!(matches!(probe, Ok(Ok(()))));
}
