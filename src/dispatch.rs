// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Request dispatch: rule selection, upstream fetch, response emission.

use crate::cache::headers_to_map;
use crate::error::{ErrorKind, ErrorSink};
use crate::inspector::{Inspector, RequestEntry};
use crate::rules::{
    BodySink, RequestCtx, ResponseHead, Rule, RuleResult, RuleSet, SynthResponse,
};
use anyhow::{Context, Result};
use hyper::body::HttpBody as _;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderValue, HOST, UPGRADE};
use hyper::{Body, Client, Method, Request, Response, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Hop-by-hop headers never forwarded upstream.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Runs one intercepted request through the rule pipeline and streams the
/// outcome back. Shared by the plain and TLS listeners.
pub struct Dispatcher {
    rules: RuleSet,
    inspector: Option<Arc<Inspector>>,
    client: Client<HttpsConnector<HttpConnector>>,
    errors: ErrorSink,
    seq: AtomicU64,
}

impl Dispatcher {
    pub fn new(rules: RuleSet, inspector: Option<Arc<Inspector>>, errors: ErrorSink) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            rules,
            inspector,
            client: Client::builder().build(https),
            errors,
            seq: AtomicU64::new(0),
        }
    }

    /// Handle one request arriving over `scheme` (`"http"` / `"https"`).
    /// An error return tears down the client connection.
    pub async fn dispatch(&self, req: Request<Body>, scheme: &'static str) -> Result<Response<Body>> {
        match self.dispatch_inner(req, scheme).await {
            Ok(res) => Ok(res),
            Err(e) => {
                (self.errors)(ErrorKind::Forward, &e);
                Err(e)
            }
        }
    }

    async fn dispatch_inner(
        &self,
        req: Request<Body>,
        scheme: &'static str,
    ) -> Result<Response<Body>> {
        if wants_websocket(req.headers()) {
            return Response::builder()
                .status(StatusCode::NOT_IMPLEMENTED)
                .body(Body::from("websocket upgrade not supported"))
                .context("failed to build upgrade rejection");
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (parts, body) = req.into_parts();
        let ctx = RequestCtx {
            seq,
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            host: host_of(&parts),
            scheme,
        };

        let target = ctx.match_target();
        let rule = self.rules.find_match(&target);
        debug!(seq, %target, rule = rule.and_then(|r| r.name.as_deref()), "dispatching");

        if let Some(insp) = &self.inspector {
            insp.on_request(
                seq,
                RequestEntry {
                    url: parts.uri.to_string(),
                    method: parts.method.to_string(),
                    version: format!("{:?}", parts.version),
                    headers: headers_to_map(&parts.headers),
                },
                rule.and_then(|r| r.name.clone()),
            );
        }

        // A matched preflight is answered as CORS-enabled without running
        // the handler.
        if rule.is_some() && parts.method == Method::OPTIONS {
            self.spawn_drain(seq, body);
            let head = preflight_head();
            return self.emit(seq, head, Body::empty(), Vec::new()).await;
        }

        let result = match rule {
            Some(r) => r
                .handler
                .on_request(&ctx)
                .await
                .unwrap_or_else(RuleResult::Fail),
            None => RuleResult::Passthrough,
        };

        match result {
            RuleResult::Suppress => {
                self.spawn_drain(seq, body);
                Ok(Response::new(Body::empty()))
            }
            RuleResult::Passthrough => {
                let target = ctx.target_uri()?;
                self.fetch(seq, &parts, body, target, false, rule).await
            }
            RuleResult::Redirect(target) => {
                self.fetch(seq, &parts, body, target, true, rule).await
            }
            RuleResult::Synth(synth) => {
                self.spawn_drain(seq, body);
                self.emit_synth(seq, synth).await
            }
            RuleResult::Fail(err) => {
                (self.errors)(ErrorKind::Forward, &err);
                self.spawn_drain(seq, body);
                let synth = SynthResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
                    .with_body(Body::from(format!("{err:#}")));
                self.emit_synth(seq, synth).await
            }
        }
    }

    /// Fetch `target` upstream with the original method and headers, piping
    /// the request body through. `rewrite_host` points the Host header at
    /// the new origin (redirects).
    async fn fetch(
        &self,
        seq: u64,
        parts: &hyper::http::request::Parts,
        body: Body,
        target: Uri,
        rewrite_host: bool,
        rule: Option<&Rule>,
    ) -> Result<Response<Body>> {
        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        if rewrite_host {
            let authority = target
                .authority()
                .with_context(|| format!("redirect target has no authority: {target}"))?;
            headers.insert(
                HOST,
                HeaderValue::from_str(authority.as_str())
                    .with_context(|| format!("bad host value: {authority}"))?,
            );
        }

        let mut builder = Request::builder().method(parts.method.clone()).uri(target.clone());
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        // only tee bodies the request actually frames; rewrapping a bodyless
        // GET would force chunked encoding upstream
        let declares_body = parts.headers.contains_key(hyper::header::CONTENT_LENGTH)
            || parts.headers.contains_key(hyper::header::TRANSFER_ENCODING);
        let upstream_body = if declares_body {
            self.forward_request_body(seq, body)
        } else {
            if let Some(insp) = &self.inspector {
                insp.on_request_end(seq);
            }
            body
        };
        let upstream_req = builder
            .body(upstream_body)
            .context("failed to build upstream request")?;

        let res = self
            .client
            .request(upstream_req)
            .await
            .with_context(|| format!("upstream request to {target} failed"))?;
        let (rparts, rbody) = res.into_parts();
        let head = ResponseHead::new(rparts.status, rparts.headers);

        let mut taps: Vec<BodySink> = Vec::new();
        if let Some(rule) = rule {
            match rule.handler.on_response(seq, &head).await {
                Ok(Some(sink)) => taps.push(sink),
                Ok(None) => {}
                Err(e) => warn!(seq, error = %e, "rule response hook failed"),
            }
        }

        self.emit(seq, head, rbody, taps).await
    }

    async fn emit_synth(&self, seq: u64, mut synth: SynthResponse) -> Result<Response<Body>> {
        // cache replays must reproduce the stored headers exactly
        if !synth.is_replay() {
            synth
                .headers
                .insert("access-control-allow-origin", HeaderValue::from_static("*"));
        }
        let head = ResponseHead::new(synth.status, synth.headers);
        self.emit(seq, head, synth.body, Vec::new()).await
    }

    /// Write the head to the client and pump the body, teeing it into the
    /// taps (cache body file, inspector body file). One chunk is in flight
    /// per consumer; a failing tap is dropped without stalling the client.
    async fn emit(
        &self,
        seq: u64,
        head: ResponseHead,
        body: Body,
        mut taps: Vec<BodySink>,
    ) -> Result<Response<Body>> {
        if let Some(insp) = &self.inspector {
            insp.on_respond(seq, &head);
            match insp.res_body_file(seq).await {
                Ok(file) => taps.push(Box::pin(file)),
                Err(e) => warn!(seq, error = %e, "inspector response file unavailable"),
            }
        }

        let mut builder = Response::builder().status(head.status);
        for (name, value) in head.headers.iter() {
            builder = builder.header(name, value);
        }

        if taps.is_empty() && self.inspector.is_none() {
            return builder.body(body).context("failed to build response");
        }

        let (mut tx, out) = Body::channel();
        let inspector = self.inspector.clone();
        tokio::spawn(async move {
            let mut body = body;
            while let Some(chunk) = body.data().await {
                match chunk {
                    Ok(data) => {
                        let mut i = 0;
                        while i < taps.len() {
                            if taps[i].write_all(&data).await.is_err() {
                                taps.swap_remove(i);
                            } else {
                                i += 1;
                            }
                        }
                        if tx.send_data(data).await.is_err() {
                            // client went away; abandon the taps as-is
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(seq, error = %e, "response body errored");
                        tx.abort();
                        break;
                    }
                }
            }
            for tap in taps.iter_mut() {
                let _ = tap.shutdown().await;
            }
            if let Some(insp) = inspector {
                insp.on_response_end(seq);
            }
        });

        builder.body(out).context("failed to build response")
    }

    /// Pipe the request body upstream, teeing chunks into the inspector's
    /// `<seq>.req` file when one is configured.
    fn forward_request_body(&self, seq: u64, body: Body) -> Body {
        let Some(insp) = self.inspector.clone() else {
            return body;
        };
        let (mut tx, out) = Body::channel();
        tokio::spawn(async move {
            let mut file = match insp.req_body_file(seq).await {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(seq, error = %e, "inspector request file unavailable");
                    None
                }
            };
            let mut body = body;
            while let Some(chunk) = body.data().await {
                match chunk {
                    Ok(data) => {
                        if let Some(f) = file.as_mut() {
                            if f.write_all(&data).await.is_err() {
                                file = None;
                            }
                        }
                        if tx.send_data(data).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        tx.abort();
                        break;
                    }
                }
            }
            if let Some(mut f) = file {
                let _ = f.flush().await;
            }
            insp.on_request_end(seq);
        });
        out
    }

    /// Consume a request body that has no upstream destination (synthesis),
    /// still recording it for the inspector.
    fn spawn_drain(&self, seq: u64, body: Body) {
        let inspector = self.inspector.clone();
        tokio::spawn(async move {
            let mut file = match &inspector {
                Some(insp) => insp.req_body_file(seq).await.ok(),
                None => None,
            };
            let mut body = body;
            while let Some(Ok(data)) = body.data().await {
                if let Some(f) = file.as_mut() {
                    if f.write_all(&data).await.is_err() {
                        file = None;
                    }
                }
            }
            if let Some(mut f) = file {
                let _ = f.flush().await;
            }
            if let Some(insp) = inspector {
                insp.on_request_end(seq);
            }
        });
    }
}

fn preflight_head() -> ResponseHead {
    let mut headers = HeaderMap::new();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert("access-control-allow-methods", HeaderValue::from_static("*"));
    headers.insert("access-control-allow-headers", HeaderValue::from_static("*"));
    ResponseHead::new(StatusCode::NO_CONTENT, headers)
}

fn host_of(parts: &hyper::http::request::Parts) -> String {
    parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "localhost".to_string())
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // headers named by the Connection header are hop-by-hop too
    let extra: Vec<String> = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()).collect())
        .unwrap_or_default();
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
    for name in extra {
        headers.remove(name.as_str());
    }
}
