// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Rule model: request contexts, handler hooks, results, and rule-string parsing.

use crate::matcher::Matcher;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hyper::header::HeaderMap;
use hyper::{Body, Method, StatusCode, Uri};
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncWrite;

pub mod cache;
pub mod content;
pub mod delay;
pub mod file;
pub mod forward;

/// Observable parts of an intercepted request handed to rule hooks.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub seq: u64,
    pub method: Method,
    /// Origin-form or absolute-form target, as received.
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Authority the request addresses (may carry a port).
    pub host: String,
    /// `"http"` or `"https"`, per the listener the request arrived on.
    pub scheme: &'static str,
}

impl RequestCtx {
    /// `host + path-with-query`: the string matchers test against.
    pub fn match_target(&self) -> String {
        let pq = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}{}", self.host, pq)
    }

    /// Absolute URL of the original target.
    pub fn target_uri(&self) -> Result<Uri> {
        if self.uri.scheme().is_some() {
            return Ok(self.uri.clone());
        }
        let pq = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}://{}{}", self.scheme, self.host, pq)
            .parse()
            .with_context(|| format!("cannot build target url for host {}", self.host))
    }
}

/// Status line and headers of a response about to be emitted.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub status_message: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            status_message: status.canonical_reason().map(str::to_string),
            headers,
        }
    }
}

/// A synthesized response. The body is inline bytes or a lazy stream;
/// either way it is consumed exactly once.
pub struct SynthResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
    replay: bool,
}

impl SynthResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::empty(),
            replay: false,
        }
    }

    pub fn text(body: impl Into<Body>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.into(),
            replay: false,
        }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Mark this response as a verbatim replay of a recorded response.
    /// The emitter delivers replayed headers exactly as stored.
    pub fn replayed(mut self) -> Self {
        self.replay = true;
        self
    }

    pub fn is_replay(&self) -> bool {
        self.replay
    }
}

/// Outcome of a rule's request hook.
pub enum RuleResult {
    /// Forward the original request unchanged.
    Passthrough,
    /// Forward the request to this URL instead.
    Redirect(Uri),
    /// The handler owns the response; dispatch ends.
    Suppress,
    /// Return this synthesized response.
    Synth(SynthResponse),
    /// Synthesize a 500 carrying the error.
    Fail(anyhow::Error),
}

/// Byte sink receiving a copy of the response body as it streams to the
/// client (the cache body file).
pub type BodySink = Pin<Box<dyn AsyncWrite + Send>>;

/// Hooks a rule exposes to the dispatch engine. Custom rules registered by
/// embedders implement the same trait as the built-ins.
#[async_trait]
pub trait RuleHandler: Send + Sync {
    /// Decide what to do with a matched request.
    async fn on_request(&self, req: &RequestCtx) -> Result<RuleResult>;

    /// Observe the upstream response before emission. May return a sink
    /// that receives a copy of the body.
    async fn on_response(&self, _seq: u64, _head: &ResponseHead) -> Result<Option<BodySink>> {
        Ok(None)
    }
}

/// One registered rule: display name, compiled matcher, handler.
pub struct Rule {
    pub name: Option<String>,
    pub matcher: Matcher,
    pub handler: Box<dyn RuleHandler>,
}

impl Rule {
    pub fn new(name: Option<String>, matcher: Matcher, handler: Box<dyn RuleHandler>) -> Self {
        Self {
            name,
            matcher,
            handler,
        }
    }
}

/// Ordered rule list; registration order is evaluation order.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// First rule whose matcher accepts `host + path-with-query`.
    pub fn find_match(&self, target: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matcher.matches(target))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Parse a CLI rule string `name|pattern|args`. Known names: `delay`,
/// `content`, `file`, `forward`, `cache`. `cache_root` overrides where
/// cache rules keep their entries.
pub fn parse_rule(spec: &str, cache_root: Option<PathBuf>) -> Result<Rule> {
    let mut parts = spec.splitn(3, '|');
    let name = parts
        .next()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("rule string missing name: {spec}"))?;
    let pattern = parts
        .next()
        .with_context(|| format!("rule string missing pattern: {spec}"))?;
    let args = parts.next().unwrap_or("");

    let matcher = Matcher::compile(pattern)?;
    let handler: Box<dyn RuleHandler> = match name {
        "delay" => Box::new(delay::DelayRule::from_args(args)?),
        "content" => Box::new(content::ContentRule::from_args(args)),
        "file" => Box::new(file::FileRule::new(PathBuf::from(args))),
        "forward" => Box::new(forward::ForwardRule::from_args(args)?),
        "cache" => Box::new(cache::CacheRule::from_args(args, cache_root)?),
        other => bail!("unknown rule name: {other}"),
    };

    Ok(Rule::new(Some(name.to_string()), matcher, handler))
}
