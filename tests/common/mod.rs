// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use devproxy::proxy::ProxyServer;
use devproxy::rules::parse_rule;

pub struct TestProxy {
    pub handle: tokio::task::JoinHandle<()>,
    pub addr: SocketAddr,
}

/// Start a proxy with the given rule strings and wait until it accepts.
pub async fn start_proxy(
    rules: &[&str],
    ca_paths: Option<(PathBuf, PathBuf)>,
    cache_dir: Option<PathBuf>,
    inspect_dir: Option<PathBuf>,
) -> anyhow::Result<TestProxy> {
    // Choose a free port by binding then dropping
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut builder = ProxyServer::builder().listen(addr);
    for spec in rules {
        builder = builder.rule(parse_rule(spec, cache_dir.clone())?);
    }
    if let Some((key_path, cert_path)) = ca_paths {
        builder = builder.root_ca_files(key_path, cert_path);
    }
    if let Some(dir) = inspect_dir {
        builder = builder.inspect(Some(dir), true);
    }
    let server = builder.build().await?;

    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Wait for the plain listener to accept connections
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            anyhow::bail!("timeout waiting for proxy to start");
        }
        if let Ok(mut s) = tokio::net::TcpStream::connect(addr).await {
            let _ = s.shutdown().await;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    Ok(TestProxy { handle, addr })
}

/// Generate a root CA and write it to temp PEM files (key, cert).
pub fn write_test_ca() -> anyhow::Result<(PathBuf, PathBuf)> {
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa,
        PKCS_ECDSA_P256_SHA256,
    };

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, "devproxy test CA");
    params.alg = &PKCS_ECDSA_P256_SHA256;
    let cert = Certificate::from_params(params)?;

    let id = uuid::Uuid::new_v4();
    let key_path = std::env::temp_dir().join(format!("devproxy_test_ca_{id}.key"));
    let cert_path = std::env::temp_dir().join(format!("devproxy_test_ca_{id}.crt"));
    std::fs::write(&key_path, cert.serialize_private_key_pem())?;
    std::fs::write(&cert_path, cert.serialize_pem()?)?;
    Ok((key_path, cert_path))
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}_{}", uuid::Uuid::new_v4()))
}
