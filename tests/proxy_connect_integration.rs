// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::{start_proxy, write_test_ca};

// Perform CONNECT against the proxy, then a TLS handshake trusting
// `ca_cert_path`, optionally advertising ALPNs and sending an inner
// request. Returns (negotiated_alpn, response_bytes).
async fn connect_and_tls(
    proxy_addr: SocketAddr,
    connect_host: &str,
    connect_port: u16,
    ca_cert_path: &Path,
    alpn_protocols: Option<&[&str]>,
    inner_request: Option<&str>,
) -> anyhow::Result<(Option<String>, Vec<u8>)> {
    let mut stream = tokio::net::TcpStream::connect(proxy_addr).await?;

    let connect = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
        host = connect_host,
        port = connect_port
    );
    stream.write_all(connect.as_bytes()).await?;

    // Read response headers until \r\n\r\n
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if Instant::now() > deadline {
            anyhow::bail!("timeout reading CONNECT response");
        }
        let n = match timeout(Duration::from_millis(500), stream.read(&mut tmp)).await {
            Ok(Ok(0)) => anyhow::bail!("unexpected EOF reading CONNECT response"),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        };
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let hdrs = String::from_utf8_lossy(&buf);
    if !hdrs.starts_with("HTTP/1.1 200") {
        anyhow::bail!("CONNECT not successful: {}", hdrs);
    }

    // TLS client trusting the test CA
    let mut root_store = rustls::RootCertStore::empty();
    let mut reader = std::io::BufReader::new(std::fs::File::open(ca_cert_path)?);
    for der in rustls_pemfile::certs(&mut reader)? {
        root_store.add(&rustls::Certificate(der))?;
    }
    let mut client_cfg = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if let Some(alpns) = alpn_protocols {
        client_cfg.alpn_protocols = alpns.iter().map(|s| s.as_bytes().to_vec()).collect();
    }

    let connector = TlsConnector::from(Arc::new(client_cfg));
    let server_name = rustls::ServerName::try_from(connect_host)
        .map_err(|_| anyhow::anyhow!("invalid server name"))?;
    let mut tls = connector.connect(server_name, stream).await?;

    let negotiated = tls
        .get_ref()
        .1
        .alpn_protocol()
        .map(|v| String::from_utf8_lossy(v).into_owned());

    let mut response = Vec::new();
    if let Some(req) = inner_request {
        tls.write_all(req.as_bytes()).await?;
        let _ = timeout(Duration::from_secs(5), tls.read_to_end(&mut response)).await;
    }

    Ok((negotiated, response))
}

#[tokio::test]
async fn connect_tls_full_forwarding() -> anyhow::Result<()> {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&mock)
        .await;

    let (key_path, cert_path) = write_test_ca()?;
    let proxy = start_proxy(&[], Some((key_path.clone(), cert_path.clone())), None, None).await?;

    // the inner request uses absolute form so the dispatcher fetches the
    // plain-http mock instead of dialing the CONNECT authority
    let inner = format!(
        "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n",
        port = mock.address().port()
    );
    let (_alpn, response) = connect_and_tls(
        proxy.addr,
        "example.com",
        443,
        &cert_path,
        None,
        Some(&inner),
    )
    .await?;

    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("ok"));

    let requests = mock.received_requests().await.expect("received requests");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method.as_ref() as &str, "GET");

    proxy.handle.abort();
    let _ = proxy.handle.await;
    let _ = std::fs::remove_file(&key_path);
    let _ = std::fs::remove_file(&cert_path);
    Ok(())
}

#[tokio::test]
async fn connect_tls_dispatches_rules() -> anyhow::Result<()> {
    let (key_path, cert_path) = write_test_ca()?;
    let proxy = start_proxy(
        &["content|/hello|world"],
        Some((key_path.clone(), cert_path.clone())),
        None,
        None,
    )
    .await?;

    let inner = "GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
    let (_alpn, response) = connect_and_tls(
        proxy.addr,
        "example.com",
        443,
        &cert_path,
        None,
        Some(inner),
    )
    .await?;

    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("world"));

    proxy.handle.abort();
    let _ = proxy.handle.await;
    let _ = std::fs::remove_file(&key_path);
    let _ = std::fs::remove_file(&cert_path);
    Ok(())
}

#[tokio::test]
async fn connect_tls_alpn_client_selects_http1() -> anyhow::Result<()> {
    let (key_path, cert_path) = write_test_ca()?;
    let proxy = start_proxy(
        &["content|/hello|world"],
        Some((key_path.clone(), cert_path.clone())),
        None,
        None,
    )
    .await?;

    let inner = "GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
    let (negotiated, _response) = connect_and_tls(
        proxy.addr,
        "example.com",
        443,
        &cert_path,
        Some(&["http/1.1"]),
        Some(inner),
    )
    .await?;
    assert_eq!(negotiated.as_deref(), Some("http/1.1"));

    proxy.handle.abort();
    let _ = proxy.handle.await;
    let _ = std::fs::remove_file(&key_path);
    let _ = std::fs::remove_file(&cert_path);
    Ok(())
}

#[tokio::test]
async fn connect_tls_rejects_h2_only_clients() -> anyhow::Result<()> {
    let (key_path, cert_path) = write_test_ca()?;
    let proxy = start_proxy(&[], Some((key_path.clone(), cert_path.clone())), None, None).await?;

    // no overlap with the server's http/1.1-only offer
    let err = connect_and_tls(proxy.addr, "example.com", 443, &cert_path, Some(&["h2"]), None)
        .await
        .expect_err("handshake should fail without a shared protocol");
    let msg = format!("{err}");
    assert!(
        msg.contains("NoApplicationProtocol") || msg.contains("no application protocol"),
        "unexpected error: {msg}"
    );

    proxy.handle.abort();
    let _ = proxy.handle.await;
    let _ = std::fs::remove_file(&key_path);
    let _ = std::fs::remove_file(&cert_path);
    Ok(())
}

#[tokio::test]
async fn connect_without_root_ca_is_refused() -> anyhow::Result<()> {
    let proxy = start_proxy(&[], None, None, None).await?;

    let mut stream = tokio::net::TcpStream::connect(proxy.addr).await?;
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await?;

    let mut response = Vec::new();
    let _ = timeout(Duration::from_secs(3), stream.read_to_end(&mut response)).await;
    assert_eq!(
        String::from_utf8_lossy(&response),
        "https proxy not enabled!"
    );

    proxy.handle.abort();
    let _ = proxy.handle.await;
    Ok(())
}
