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

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http::{header::PROXY_AUTHENTICATE, HeaderMap, Method, StatusCode};
use rustls::pki_types::ServerName;
use scion_forward_proxy::{
    config::{PathConfig, ProxyConfig, ProxyProtocol, UpstreamProtocol},
    proxy::{
        flow::ResponseParts,
        h2::H2Stream,
        http1::{self, Limits},
    },
    tls::TlsIdentity,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use common::*;

async fn connect(proxy: SocketAddr) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect(proxy).await.expect("connect to proxy"))
}

async fn get_via_proxy(
    proxy: SocketAddr,
    url: &str,
    host: &str,
    credentials: Option<&str>,
) -> ResponseParts {
    let mut io = connect(proxy).await;
    roundtrip_h1(&mut io, &raw_request("GET", url, host, credentials), &Method::GET).await
}

/// CONNECTs to `authority`, then fetches `resource` through the tunnel. Returns the CONNECT
/// response and, when the tunnel came up, the tunneled response.
async fn connect_and_get<S>(
    io: &mut BufReader<S>,
    authority: &str,
    resource: &str,
    credentials: Option<&str>,
) -> (ResponseParts, Option<ResponseParts>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connect = roundtrip_h1(
        io,
        &raw_request("CONNECT", authority, authority, credentials),
        &Method::CONNECT,
    )
    .await;
    if connect.status != StatusCode::OK {
        return (connect, None);
    }

    let inner = format!("GET {resource} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");
    let tunneled = roundtrip_h1(io, &inner, &Method::GET).await;
    (connect, Some(tunneled))
}

fn assert_proxy_auth_required(response: &ResponseParts) {
    assert_eq!(response.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert_eq!(response.body.as_bytes(), PROXY_AUTH_BODY);
    assert!(response.headers.contains_key(PROXY_AUTHENTICATE));
}

#[tokio::test]
async fn get_requires_valid_credentials() {
    let origin = spawn_origin().await;
    let proxy = start_proxy(proxy_config(None)).await;

    for resource in RESOURCES {
        let url = format!("http://{origin}{resource}");
        let host = origin.to_string();

        let response = get_via_proxy(proxy.addr, &url, &host, None).await;
        assert_proxy_auth_required(&response);

        let response = get_via_proxy(proxy.addr, &url, &host, Some(CREDENTIALS_INCORRECT)).await;
        assert_proxy_auth_required(&response);
    }
}

#[tokio::test]
async fn get_with_credentials_reaches_origin() {
    let origin = spawn_origin().await;
    let proxy = start_proxy(proxy_config(None)).await;

    for credentials in [CREDENTIALS_NO_POLICY, CREDENTIALS_INVALID_POLICY] {
        for resource in RESOURCES {
            let url = format!("http://{origin}{resource}");
            let response =
                get_via_proxy(proxy.addr, &url, &origin.to_string(), Some(credentials)).await;
            assert_eq!(response.status, StatusCode::OK, "{resource}");
            assert_eq!(response.body.as_bytes(), expected_body(resource));
        }
    }
}

#[tokio::test]
async fn origin_errors_are_relayed_unchanged() {
    let origin = spawn_origin().await;
    let proxy = start_proxy(proxy_config(None)).await;

    let url = format!("http://{origin}/missing");
    let response =
        get_via_proxy(proxy.addr, &url, &origin.to_string(), Some(CREDENTIALS_NO_POLICY)).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn repeated_requests_on_one_connection_are_identical() {
    let origin = spawn_origin().await;
    let proxy = start_proxy(proxy_config(None)).await;
    let mut io = connect(proxy.addr).await;

    let raw = raw_request(
        "GET",
        &format!("http://{origin}/image.png"),
        &origin.to_string(),
        Some(CREDENTIALS_NO_POLICY),
    );
    let first = roundtrip_h1(&mut io, &raw, &Method::GET).await;
    let second = roundtrip_h1(&mut io, &raw, &Method::GET).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body.as_bytes(), second.body.as_bytes());
}

#[tokio::test]
async fn connect_requires_valid_credentials() {
    let origin = spawn_origin().await;
    let proxy = start_proxy(proxy_config(None)).await;
    let authority = origin.to_string();

    for credentials in [None, Some(CREDENTIALS_INCORRECT)] {
        let mut io = connect(proxy.addr).await;
        let (response, tunneled) = connect_and_get(&mut io, &authority, "/", credentials).await;
        assert_proxy_auth_required(&response);
        assert!(tunneled.is_none());
    }
}

#[tokio::test]
async fn connect_tunnels_to_origin() {
    let origin = spawn_origin().await;
    let proxy = start_proxy(proxy_config(None)).await;
    let authority = origin.to_string();

    for credentials in [CREDENTIALS_NO_POLICY, CREDENTIALS_INVALID_POLICY] {
        for resource in RESOURCES {
            let mut io = connect(proxy.addr).await;
            let (response, tunneled) =
                connect_and_get(&mut io, &authority, resource, Some(credentials)).await;
            assert_eq!(response.status, StatusCode::OK);
            let tunneled = tunneled.expect("tunnel established");
            assert_eq!(tunneled.status, StatusCode::OK);
            assert_eq!(tunneled.body.as_bytes(), expected_body(resource));
        }
    }
}

#[tokio::test]
async fn management_api_is_served_for_the_proxy_itself() {
    let proxy = start_proxy(proxy_config(None)).await;
    let host = proxy.addr.to_string();
    let mut io = connect(proxy.addr).await;

    let put = format!(
        "PUT /policy HTTP/1.1\r\nHost: {host}\r\nProxy-Authorization: {CREDENTIALS_NO_POLICY}\r\nContent-Length: 13\r\n\r\n[\"+ 42\", \"-\"]"
    );
    let response = roundtrip_h1(&mut io, &put, &Method::PUT).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body.is_empty());

    let get = raw_request("GET", "/policy", &host, Some(CREDENTIALS_NO_POLICY));
    let response = roundtrip_h1(&mut io, &get, &Method::GET).await;
    assert_eq!(response.body.as_bytes(), b"[\"+ 42\",\"-\"]\n");

    // Without a credential the caller is anonymous and sees its own empty policy.
    let get = raw_request("GET", "/policy", &host, None);
    let response = roundtrip_h1(&mut io, &get, &Method::GET).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_bytes(), b"[]\n");

    let get = raw_request("GET", "/nowhere", &host, None);
    let response = roundtrip_h1(&mut io, &get, &Method::GET).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

fn config_with_paths() -> ProxyConfig {
    let mut config = proxy_config(None);
    for id in ["42", "43"] {
        config.transport.paths.push(PathConfig {
            destination: SCION_IA.into(),
            id: id.into(),
            hops: vec!["1-ff00:0:111".into(), SCION_IA.into()],
        });
    }
    config
}

#[tokio::test]
async fn scion_hosts_follow_policy_and_record_usage() {
    let origin = spawn_origin().await;
    let proxy = start_proxy(config_with_paths()).await;
    let host = proxy.addr.to_string();
    let target = format!("{SCION_HOST}:{}", origin.port());
    let url = format!("http://{target}/");

    // No policy: the first path is used.
    let response = get_via_proxy(proxy.addr, &url, &target, Some(CREDENTIALS_NO_POLICY)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_bytes(), INDEX_BODY);

    let mut io = connect(proxy.addr).await;
    let put = format!(
        "PUT /policy HTTP/1.1\r\nHost: {host}\r\nProxy-Authorization: {CREDENTIALS_NO_POLICY}\r\nContent-Length: 13\r\n\r\n[\"+ 43\", \"-\"]"
    );
    assert_eq!(roundtrip_h1(&mut io, &put, &Method::PUT).await.status, StatusCode::OK);

    let response = get_via_proxy(proxy.addr, &url, &target, Some(CREDENTIALS_NO_POLICY)).await;
    assert_eq!(response.status, StatusCode::OK);

    let mut tunnel = connect(proxy.addr).await;
    let (response, tunneled) =
        connect_and_get(&mut tunnel, &target, "/image.png", Some(CREDENTIALS_NO_POLICY)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(tunneled.expect("tunnel").body.as_bytes(), IMAGE_BODY);

    let get = raw_request("GET", "/path-usage", &host, Some(CREDENTIALS_NO_POLICY));
    let usage = roundtrip_h1(&mut io, &get, &Method::GET).await;
    let usage: serde_json::Value = serde_json::from_slice(usage.body.as_bytes()).expect("JSON");
    assert_eq!(usage, serde_json::json!({"42": 1, "43": 2}));

    // Ordinary destinations never show up in the usage map.
    let plain = format!("http://{origin}/");
    get_via_proxy(proxy.addr, &plain, &origin.to_string(), Some(CREDENTIALS_NO_POLICY)).await;
    assert_eq!(
        proxy.ctx.policies.path_usage("policy").values().sum::<u64>(),
        3
    );
}

#[tokio::test]
async fn policy_without_permitted_path_fails_the_dial() {
    let origin = spawn_origin().await;
    let proxy = start_proxy(config_with_paths()).await;
    proxy
        .ctx
        .policies
        .set_policy("policy", vec!["+ 99".into(), "-".into()])
        .expect("policy");

    let target = format!("{SCION_HOST}:{}", origin.port());
    let response = get_via_proxy(
        proxy.addr,
        &format!("http://{target}/"),
        &target,
        Some(CREDENTIALS_NO_POLICY),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);

    let mut io = connect(proxy.addr).await;
    let (response, tunneled) =
        connect_and_get(&mut io, &target, "/", Some(CREDENTIALS_NO_POLICY)).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert!(tunneled.is_none());
    assert!(proxy.ctx.policies.path_usage("policy").is_empty());
}

async fn h2_client<S>(io: S) -> h2::client::SendRequest<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, connection) = h2::client::handshake(io).await.expect("h2 handshake");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client.ready().await.expect("h2 ready")
}

async fn collect_body(mut body: h2::RecvStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.expect("body chunk");
        let _ = body.flow_control().release_capacity(chunk.len());
        out.extend_from_slice(&chunk);
    }
    out
}

async fn h2_get(
    client: &h2::client::SendRequest<Bytes>,
    url: &str,
    credentials: Option<&str>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = http::Request::builder().method(Method::GET).uri(url);
    if let Some(credentials) = credentials {
        builder = builder.header("proxy-authorization", credentials);
    }
    let request = builder.body(()).expect("request");
    let mut client = client.clone().ready().await.expect("h2 ready");
    let (response, _) = client.send_request(request, true).expect("send request");
    let response = response.await.expect("response");
    let (parts, body) = response.into_parts();
    (parts.status, parts.headers, collect_body(body).await)
}

/// Opens an HTTP/2 CONNECT stream and views it as a byte stream once the proxy answers 200.
async fn h2_open_tunnel(
    client: &h2::client::SendRequest<Bytes>,
    authority: &str,
    credentials: &str,
) -> Result<H2Stream, StatusCode> {
    let request = http::Request::builder()
        .method(Method::CONNECT)
        .uri(authority)
        .header("proxy-authorization", credentials)
        .body(())
        .expect("request");
    let mut client = client.clone().ready().await.expect("h2 ready");
    let (response, send) = client.send_request(request, false).expect("send CONNECT");
    let response = response.await.expect("CONNECT response");
    if response.status() != StatusCode::OK {
        return Err(response.status());
    }
    Ok(H2Stream::new(response.into_body(), send))
}

async fn h2_connect_and_get(
    client: &h2::client::SendRequest<Bytes>,
    authority: &str,
    resource: &str,
    credentials: &str,
) -> (StatusCode, Option<ResponseParts>) {
    let mut tunnel = match h2_open_tunnel(client, authority, credentials).await {
        Ok(tunnel) => tunnel,
        Err(status) => return (status, None),
    };

    let inner = format!("GET {resource} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");
    tunnel.write_all(inner.as_bytes()).await.expect("send tunneled request");
    tunnel.shutdown().await.expect("close request side");
    let mut raw = Vec::new();
    tunnel.read_to_end(&mut raw).await.expect("tunneled bytes");
    let mut reader = BufReader::new(raw.as_slice());
    let tunneled = http1::read_response(&mut reader, &Method::GET, &Limits::default())
        .await
        .expect("tunneled response");
    (StatusCode::OK, Some(tunneled))
}

#[tokio::test]
async fn h2c_forward_and_connect() {
    let origin = spawn_origin().await;
    let proxy = start_proxy(proxy_config(None)).await;
    let stream = TcpStream::connect(proxy.addr).await.expect("connect");
    let client = h2_client(stream).await;

    for resource in RESOURCES {
        let url = format!("http://{origin}{resource}");
        let (status, _, body) = h2_get(&client, &url, None).await;
        assert_eq!(status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(body, PROXY_AUTH_BODY);

        let (status, _, body) = h2_get(&client, &url, Some(CREDENTIALS_NO_POLICY)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, expected_body(resource));

        let (status, tunneled) = h2_connect_and_get(
            &client,
            &origin.to_string(),
            resource,
            CREDENTIALS_INVALID_POLICY,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tunneled.expect("tunnel").body.as_bytes(), expected_body(resource));
    }

    let (status, _) =
        h2_connect_and_get(&client, &origin.to_string(), "/", CREDENTIALS_INCORRECT).await;
    assert_eq!(status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
}

fn tls_connector(identity: &TlsIdentity, alpn: &[u8]) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(identity.chain()[0].clone())
        .expect("trust listener certificate");
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn tls_listener_serves_http1_and_h2() {
    let dir = tempfile::tempdir().expect("tempdir");
    let identity = test_identity(dir.path());
    let origin = spawn_origin().await;

    let mut config = proxy_config(None);
    config.listener.proxy_protocol = ProxyProtocol::Tls;
    let proxy = start_proxy_with_identity(config, Some(&identity)).await;
    let server_name = ServerName::try_from("localhost").expect("server name");

    let tcp = TcpStream::connect(proxy.addr).await.expect("connect");
    let tls = tls_connector(&identity, b"http/1.1")
        .connect(server_name.clone(), tcp)
        .await
        .expect("TLS handshake");
    let mut io = BufReader::new(tls);
    let url = format!("http://{origin}/");
    let response = roundtrip_h1(
        &mut io,
        &raw_request("GET", &url, &origin.to_string(), None),
        &Method::GET,
    )
    .await;
    assert_proxy_auth_required(&response);
    let (response, tunneled) =
        connect_and_get(&mut io, &origin.to_string(), "/image.png", Some(CREDENTIALS_NO_POLICY))
            .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(tunneled.expect("tunnel").body.as_bytes(), IMAGE_BODY);

    let tcp = TcpStream::connect(proxy.addr).await.expect("connect");
    let tls = tls_connector(&identity, b"h2")
        .connect(server_name, tcp)
        .await
        .expect("TLS handshake");
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(b"h2".as_slice()));
    let client = h2_client(tls).await;
    let (status, _, body) = h2_get(&client, &url, Some(CREDENTIALS_NO_POLICY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, INDEX_BODY);
}

fn origin_protocol(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ORIGIN_PROTOCOL_HEADER)
        .and_then(|value| value.to_str().ok())
}

/// One client connection to the proxy, in each protocol the listener speaks.
enum ClientKind {
    Http1,
    H2c,
    TlsHttp1,
    TlsH2,
}

/// Fetches `url` through the proxy over a fresh connection of the given kind.
async fn fetch_via(
    kind: &ClientKind,
    proxy: SocketAddr,
    identity: &TlsIdentity,
    url: &str,
    host: &str,
) -> (StatusCode, Option<String>, Vec<u8>) {
    let server_name = ServerName::try_from("localhost").expect("server name");
    let raw = raw_request("GET", url, host, Some(CREDENTIALS_NO_POLICY));
    match kind {
        ClientKind::Http1 => {
            let mut io = connect(proxy).await;
            let response = roundtrip_h1(&mut io, &raw, &Method::GET).await;
            let protocol = origin_protocol(&response.headers).map(str::to_string);
            (response.status, protocol, response.body.as_bytes().to_vec())
        }
        ClientKind::TlsHttp1 => {
            let tcp = TcpStream::connect(proxy).await.expect("connect");
            let tls = tls_connector(identity, b"http/1.1")
                .connect(server_name, tcp)
                .await
                .expect("TLS handshake");
            let mut io = BufReader::new(tls);
            let response = roundtrip_h1(&mut io, &raw, &Method::GET).await;
            let protocol = origin_protocol(&response.headers).map(str::to_string);
            (response.status, protocol, response.body.as_bytes().to_vec())
        }
        ClientKind::H2c => {
            let client = h2_client(TcpStream::connect(proxy).await.expect("connect")).await;
            let (status, headers, body) = h2_get(&client, url, Some(CREDENTIALS_NO_POLICY)).await;
            (status, origin_protocol(&headers).map(str::to_string), body)
        }
        ClientKind::TlsH2 => {
            let tcp = TcpStream::connect(proxy).await.expect("connect");
            let tls = tls_connector(identity, b"h2")
                .connect(server_name, tcp)
                .await
                .expect("TLS handshake");
            let client = h2_client(tls).await;
            let (status, headers, body) = h2_get(&client, url, Some(CREDENTIALS_NO_POLICY)).await;
            (status, origin_protocol(&headers).map(str::to_string), body)
        }
    }
}

#[tokio::test]
async fn every_client_protocol_reaches_an_h2_origin() {
    let dir = tempfile::tempdir().expect("tempdir");
    let identity = test_identity(dir.path());
    let origin = spawn_h2_origin().await;

    let mut plain = proxy_config(None);
    plain.upstream.protocol = UpstreamProtocol::H2;
    let plain = start_proxy(plain).await;

    let mut tls = proxy_config(None);
    tls.upstream.protocol = UpstreamProtocol::H2;
    tls.listener.proxy_protocol = ProxyProtocol::Tls;
    let tls = start_proxy_with_identity(tls, Some(&identity)).await;

    let scion_target = format!("{SCION_HOST}:{}", origin.port());
    let cases = [
        (ClientKind::Http1, plain.addr),
        (ClientKind::H2c, plain.addr),
        (ClientKind::TlsHttp1, tls.addr),
        (ClientKind::TlsH2, tls.addr),
    ];
    for (kind, proxy) in &cases {
        // Both ordinary routing and a SCION host land on the same h2c origin.
        for host in [origin.to_string(), scion_target.clone()] {
            for resource in RESOURCES {
                let url = format!("http://{host}{resource}");
                let (status, protocol, body) = fetch_via(kind, *proxy, &identity, &url, &host).await;
                assert_eq!(status, StatusCode::OK, "{url}");
                assert_eq!(protocol.as_deref(), Some("h2"), "{url}");
                assert_eq!(body, expected_body(resource), "{url}");
            }
        }

        let url = format!("http://{origin}/missing");
        let (status, protocol, _) = fetch_via(kind, *proxy, &identity, &url, &origin.to_string()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(protocol.as_deref(), Some("h2"));
    }
}

#[tokio::test]
async fn tls_origins_negotiate_the_protocol_by_alpn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let identity = test_identity(dir.path());
    let origin = spawn_tls_origin(&identity).await;

    let mut config = proxy_config(None);
    config.upstream.ca_bundle = Some(dir.path().join("proxy.crt"));
    let proxy = start_proxy(config).await;

    let host = format!("127.0.0.1:{}", origin.port());
    for kind in [ClientKind::Http1, ClientKind::H2c] {
        for resource in RESOURCES {
            let url = format!("https://{host}{resource}");
            let (status, protocol, body) = fetch_via(&kind, proxy.addr, &identity, &url, &host).await;
            assert_eq!(status, StatusCode::OK, "{url}");
            assert_eq!(protocol.as_deref(), Some("h2"), "{url}");
            assert_eq!(body, expected_body(resource), "{url}");
        }
    }
}

#[tokio::test]
async fn connect_tunnels_carry_http2() {
    let origin = spawn_h2_origin().await;
    let proxy = start_proxy(proxy_config(None)).await;
    let authority = origin.to_string();

    // HTTP/1.1 CONNECT; the origin's preface may already sit in the reader's buffer.
    let mut io = connect(proxy.addr).await;
    let response = roundtrip_h1(
        &mut io,
        &raw_request("CONNECT", &authority, &authority, Some(CREDENTIALS_NO_POLICY)),
        &Method::CONNECT,
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    let inner = h2_client(io).await;
    for resource in RESOURCES {
        let url = format!("http://{authority}{resource}");
        let (status, headers, body) = h2_get(&inner, &url, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(origin_protocol(&headers), Some("h2"));
        assert_eq!(body, expected_body(resource));
    }

    // HTTP/2 CONNECT carrying a second HTTP/2 connection.
    let outer = h2_client(TcpStream::connect(proxy.addr).await.expect("connect")).await;
    let tunnel = h2_open_tunnel(&outer, &authority, CREDENTIALS_NO_POLICY)
        .await
        .expect("tunnel established");
    let inner = h2_client(tunnel).await;
    for resource in RESOURCES {
        let url = format!("http://{authority}{resource}");
        let (status, headers, body) = h2_get(&inner, &url, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(origin_protocol(&headers), Some("h2"));
        assert_eq!(body, expected_body(resource));
    }
}

#[tokio::test]
async fn oversized_request_is_refused_without_taking_the_proxy_down() {
    let mut config = proxy_config(None);
    config.listener.max_header_bytes = 1024;
    let proxy = start_proxy(config).await;

    let mut io = connect(proxy.addr).await;
    let raw = "POST http://example.invalid/ HTTP/1.1\r\nHost: example.invalid\r\nContent-Length: 17592186044416\r\n\r\n";
    let response = roundtrip_h1(&mut io, raw, &Method::POST).await;
    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);

    let mut io = connect(proxy.addr).await;
    let raw = format!(
        "GET http://example.invalid/ HTTP/1.1\r\nHost: example.invalid\r\nX-Filler: {}\r\n\r\n",
        "a".repeat(2048)
    );
    let response = roundtrip_h1(&mut io, &raw, &Method::GET).await;
    assert_eq!(response.status, StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);

    let mut io = connect(proxy.addr).await;
    let raw = "POST http://example.invalid/ HTTP/1.1\r\nHost: example.invalid\r\nTransfer-Encoding: chunked\r\n\r\nfffffffffffffff\r\n";
    let response = roundtrip_h1(&mut io, raw, &Method::POST).await;
    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);

    // The listener is still serving.
    let response = get_via_proxy(proxy.addr, "http://example.invalid/", "example.invalid", None).await;
    assert_proxy_auth_required(&response);
}

#[tokio::test]
async fn oversized_h2_request_body_is_refused() {
    let mut config = proxy_config(None);
    config.listener.max_body_bytes = 1024;
    let proxy = start_proxy(config).await;
    let client = h2_client(TcpStream::connect(proxy.addr).await.expect("connect")).await;

    let request = http::Request::builder()
        .method(Method::POST)
        .uri("http://example.invalid/")
        .body(())
        .expect("request");
    let mut sender = client.clone().ready().await.expect("h2 ready");
    let (response, mut send) = sender.send_request(request, false).expect("send request");
    send.send_data(Bytes::from(vec![b'x'; 4096]), true)
        .expect("send body");
    let response = response.await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
