// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Listener pair: plain listener, internal TLS listener, CONNECT bridge.

use crate::ca::{self, CertificateAuthority};
use crate::dispatch::Dispatcher;
use crate::error::{log_sink, ErrorKind, ErrorSink};
use crate::inspector::Inspector;
use crate::rules::{Rule, RuleSet};
use anyhow::{bail, Context as _, Result};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const CONNECT_HEAD_LIMIT: usize = 16 * 1024;

/// Configures and builds a [`ProxyServer`].
pub struct ProxyBuilder {
    listen: SocketAddr,
    rules: RuleSet,
    ca: Option<Arc<CertificateAuthority>>,
    ca_paths: Option<(PathBuf, PathBuf)>,
    inspector: Option<Arc<Inspector>>,
    inspect: bool,
    inspect_dir: Option<PathBuf>,
    inspect_keep: bool,
    errors: ErrorSink,
}

impl ProxyBuilder {
    /// Listen address for the plain listener (default `127.0.0.1:8080`).
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    /// Register a rule. Registration order is evaluation order; custom
    /// handlers use the same hooks as the built-ins.
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        for rule in rules {
            self.rules.push(rule);
        }
        self
    }

    /// Root CA PEM files (private key, certificate) enabling HTTPS
    /// interception. Invalid files fail only the TLS listener bring-up.
    pub fn root_ca_files(mut self, key_path: PathBuf, cert_path: PathBuf) -> Self {
        self.ca_paths = Some((key_path, cert_path));
        self
    }

    /// Use an already-loaded root CA.
    pub fn root_ca(mut self, ca: Arc<CertificateAuthority>) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Enable the inspector, journaling into `dir` (or a fresh temp dir).
    pub fn inspect(mut self, dir: Option<PathBuf>, keep: bool) -> Self {
        self.inspect = true;
        self.inspect_dir = dir;
        self.inspect_keep = keep;
        self
    }

    /// Use an already-constructed inspector.
    pub fn inspector(mut self, inspector: Arc<Inspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn error_sink(mut self, sink: ErrorSink) -> Self {
        self.errors = sink;
        self
    }

    pub async fn build(self) -> Result<ProxyServer> {
        let inspector = match self.inspector {
            Some(insp) => Some(insp),
            None if self.inspect => {
                Some(Inspector::new(self.inspect_dir, self.inspect_keep).await?)
            }
            None => None,
        };

        let ca = match (self.ca, self.ca_paths) {
            (Some(ca), _) => Some(ca),
            (None, Some((key_path, cert_path))) => {
                match CertificateAuthority::from_pem_files(&key_path, &cert_path).await {
                    Ok(ca) => Some(ca),
                    Err(e) => {
                        (self.errors)(ErrorKind::Https, &e);
                        warn!("continuing without https interception");
                        None
                    }
                }
            }
            (None, None) => None,
        };

        let dispatcher = Arc::new(Dispatcher::new(self.rules, inspector.clone(), self.errors.clone()));
        Ok(ProxyServer {
            listen: self.listen,
            dispatcher,
            ca,
            inspector,
            errors: self.errors,
        })
    }
}

/// The intercepting proxy: a plain listener on the configured port and,
/// when a root CA is present, an internal TLS listener that CONNECT
/// traffic is bridged into.
pub struct ProxyServer {
    listen: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    ca: Option<Arc<CertificateAuthority>>,
    inspector: Option<Arc<Inspector>>,
    errors: ErrorSink,
}

impl ProxyServer {
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            rules: RuleSet::new(),
            ca: None,
            ca_paths: None,
            inspector: None,
            inspect: false,
            inspect_dir: None,
            inspect_keep: false,
            errors: log_sink(),
        }
    }

    pub fn inspector(&self) -> Option<&Arc<Inspector>> {
        self.inspector.as_ref()
    }

    pub fn ca(&self) -> Option<&Arc<CertificateAuthority>> {
        self.ca.as_ref()
    }

    /// Serve until the plain listener dies.
    pub async fn run(&self) -> Result<()> {
        let tls_addr = match &self.ca {
            Some(ca) => {
                match start_tls_listener(ca.clone(), self.dispatcher.clone(), self.errors.clone())
                    .await
                {
                    Ok(addr) => {
                        info!(%addr, "internal tls listener ready");
                        Some(addr)
                    }
                    Err(e) => {
                        (self.errors)(ErrorKind::Https, &e);
                        None
                    }
                }
            }
            None => None,
        };

        let listener = match TcpListener::bind(self.listen).await {
            Ok(l) => l,
            Err(e) => {
                let err = anyhow::Error::new(e)
                    .context(format!("failed to bind plain listener on {}", self.listen));
                (self.errors)(ErrorKind::Http, &err);
                return Err(err);
            }
        };
        info!(listen = %self.listen, "listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted");
                    let dispatcher = self.dispatcher.clone();
                    let errors = self.errors.clone();
                    tokio::spawn(handle_plain(stream, dispatcher, tls_addr, errors));
                }
                Err(e) => {
                    let err = anyhow::Error::new(e).context("accept failed");
                    (self.errors)(ErrorKind::Http, &err);
                }
            }
        }
    }
}

async fn start_tls_listener(
    ca: Arc<CertificateAuthority>,
    dispatcher: Arc<Dispatcher>,
    errors: ErrorSink,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to bind internal tls listener")?;
    let addr = listener
        .local_addr()
        .context("internal tls listener has no local address")?;
    let acceptor = TlsAcceptor::from(Arc::new(ca::server_config(ca)));

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let acceptor = acceptor.clone();
                    let dispatcher = dispatcher.clone();
                    let errors = errors.clone();
                    tokio::spawn(async move {
                        let tls = match acceptor.accept(stream).await {
                            Ok(tls) => tls,
                            Err(e) => {
                                let err =
                                    anyhow::Error::new(e).context("tls handshake failed");
                                (errors)(ErrorKind::Https, &err);
                                return;
                            }
                        };
                        let svc = service_fn(move |req| {
                            let d = dispatcher.clone();
                            async move { d.dispatch(req, "https").await }
                        });
                        if let Err(e) =
                            Http::new().http1_only(true).serve_connection(tls, svc).await
                        {
                            if !benign_serve_error(&e) {
                                let err =
                                    anyhow::Error::new(e).context("tls connection failed");
                                (errors)(ErrorKind::Https, &err);
                            }
                        }
                    });
                }
                Err(e) => {
                    let err = anyhow::Error::new(e).context("tls accept failed");
                    (errors)(ErrorKind::Https, &err);
                }
            }
        }
    });

    Ok(addr)
}

/// Sniff the first bytes of a plain connection: CONNECT goes to the
/// bridge, everything else is served as HTTP.
async fn handle_plain(
    mut stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    tls_addr: Option<SocketAddr>,
    errors: ErrorSink,
) {
    let mut buf = Vec::with_capacity(8192);
    let mut tmp = [0u8; 8192];
    loop {
        if buf.len() >= 8 || !b"CONNECT ".starts_with(buf.as_slice()) {
            break;
        }
        match stream.read(&mut tmp).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(e) => {
                let err = anyhow::Error::new(e).context("failed to read request");
                (errors)(ErrorKind::Http, &err);
                return;
            }
        }
    }
    if buf.is_empty() {
        return;
    }

    if buf.starts_with(b"CONNECT ") {
        if let Err(e) = bridge_connect(stream, buf, tls_addr).await {
            (errors)(ErrorKind::Connect, &e);
        }
        return;
    }

    let svc = service_fn(move |req| {
        let d = dispatcher.clone();
        async move { d.dispatch(req, "http").await }
    });
    let io = PrefixedIo::new(buf, stream);
    if let Err(e) = Http::new().http1_only(true).serve_connection(io, svc).await {
        if !benign_serve_error(&e) {
            let err = anyhow::Error::new(e).context("plain connection failed");
            (errors)(ErrorKind::Http, &err);
        }
    }
}

/// Raw TCP splice between the client and the internal TLS listener. Any
/// handshake bytes already read past the CONNECT head are forwarded first.
async fn bridge_connect(
    mut client: TcpStream,
    mut buf: Vec<u8>,
    tls_addr: Option<SocketAddr>,
) -> Result<()> {
    let Some(addr) = tls_addr else {
        let _ = client.write_all(b"https proxy not enabled!").await;
        return Ok(());
    };

    let mut tmp = [0u8; 8192];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > CONNECT_HEAD_LIMIT {
            bail!("CONNECT header too large");
        }
        let n = client
            .read(&mut tmp)
            .await
            .context("failed to read CONNECT header")?;
        if n == 0 {
            bail!("connection closed before CONNECT header end");
        }
        buf.extend_from_slice(&tmp[..n]);
    };
    debug!(target = %connect_target(&buf), "bridging CONNECT");

    let mut backend = TcpStream::connect(addr)
        .await
        .context("internal tls listener unreachable")?;
    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .context("failed to confirm tunnel")?;
    if head_end < buf.len() {
        backend
            .write_all(&buf[head_end..])
            .await
            .context("failed to forward handshake bytes")?;
    }

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok(_) => Ok(()),
        Err(e) if is_benign_teardown(&e) => Ok(()),
        Err(e) => Err(e).context("tunnel relay failed"),
    }
}

fn connect_target(head: &[u8]) -> String {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    String::from_utf8_lossy(&head[..line_end])
        .split_whitespace()
        .nth(1)
        .unwrap_or("")
        .to_string()
}

fn is_benign_teardown(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

fn benign_serve_error(e: &hyper::Error) -> bool {
    // user errors were already reported by the dispatcher
    e.is_incomplete_message() || e.is_canceled() || e.is_user()
}

/// Serves already-sniffed bytes before reading from the socket again.
struct PrefixedIo<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedIo<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
