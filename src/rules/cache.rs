// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Cache rule: serve fresh entries from disk, record misses for write-back.

use crate::cache::{headers_to_map, map_to_headers, CacheHead, CacheKey, CacheStore};
use crate::rules::{
    BodySink, RequestCtx, ResponseHead, RuleHandler, RuleResult, SynthResponse,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper::{Body, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
struct CacheArgs {
    ttl: Option<u64>,
    #[serde(default, rename = "cacheByQuery")]
    cache_by_query: bool,
    dir: Option<PathBuf>,
}

/// Stateful cache handler. The `seq -> key` map connects the response hook
/// back to the key selected at request time; it is scoped to this instance,
/// never shared across rules or proxies.
pub struct CacheRule {
    store: CacheStore,
    ttl: Option<u64>,
    by_query: bool,
    pending: Mutex<HashMap<u64, CacheKey>>,
}

impl CacheRule {
    pub fn new(store: CacheStore, ttl: Option<u64>, by_query: bool) -> Self {
        Self {
            store,
            ttl,
            by_query,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// CLI args: empty (no TTL), a bare TTL in seconds, or a JSON object
    /// `{"ttl": 60, "cacheByQuery": true, "dir": "..."}`.
    pub fn from_args(args: &str, root: Option<PathBuf>) -> Result<Self> {
        let args = args.trim();
        let parsed = if args.is_empty() {
            CacheArgs::default()
        } else if let Ok(ttl) = args.parse::<u64>() {
            CacheArgs {
                ttl: Some(ttl),
                ..CacheArgs::default()
            }
        } else {
            serde_json::from_str(args)
                .with_context(|| format!("cache rule wants a TTL or a JSON object, got: {args}"))?
        };

        let store = CacheStore::new(parsed.dir.or(root));
        Ok(Self::new(store, parsed.ttl, parsed.cache_by_query))
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Drop every entry on disk. The pending map is untouched; in-flight
    /// responses finish their write-back into a recreated directory.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    fn key_for(&self, req: &RequestCtx) -> CacheKey {
        let path = req.uri.path();
        let query = req.uri.query();
        self.store
            .key(&req.host, path, query, req.method.as_str(), self.by_query)
    }
}

#[async_trait]
impl RuleHandler for CacheRule {
    async fn on_request(&self, req: &RequestCtx) -> Result<RuleResult> {
        let key = self.key_for(req);

        if let Some(head) = self.store.load_head(&key).await? {
            if CacheStore::is_fresh(&head, self.ttl) {
                debug!(seq = req.seq, "cache hit");
                let status = StatusCode::from_u16(head.status_code)
                    .with_context(|| format!("cached status out of range: {}", head.status_code))?;
                let body = match self.store.open_body(&key).await {
                    Some(file) => Body::wrap_stream(ReaderStream::new(file)),
                    None => Body::empty(),
                };
                let synth = SynthResponse::new(status)
                    .with_headers(map_to_headers(&head.headers))
                    .with_body(body)
                    .replayed();
                return Ok(RuleResult::Synth(synth));
            }
            debug!(seq = req.seq, "cache entry expired");
        }

        self.pending.lock().unwrap().insert(req.seq, key);
        Ok(RuleResult::Passthrough)
    }

    async fn on_response(&self, seq: u64, head: &ResponseHead) -> Result<Option<BodySink>> {
        let key = match self.pending.lock().unwrap().remove(&seq) {
            Some(key) => key,
            None => return Ok(None),
        };

        let cache_head = CacheHead {
            status_code: head.status.as_u16(),
            status_message: head.status_message.clone(),
            headers: headers_to_map(&head.headers),
            update_time: chrono::Utc::now().timestamp_millis(),
        };
        // Head lands on disk before the first body byte flows.
        let body_file = self.store.create(&key, &cache_head).await?;
        debug!(seq, "cache write-back started");
        Ok(Some(Box::pin(body_file)))
    }
}
