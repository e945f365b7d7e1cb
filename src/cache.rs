// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! On-disk response cache: head/body file pairs keyed by host, path and method.

use anyhow::{Context, Result};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Head-file sidecar of a cached response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHead {
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub headers: HashMap<String, Vec<String>>,
    /// Wall-clock write time, epoch milliseconds.
    pub update_time: i64,
}

/// Resolved location of one cache entry: `<root>/<host><path>/<method>[.<md5>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    dir: PathBuf,
    base: String,
}

impl CacheKey {
    pub fn head_path(&self) -> PathBuf {
        self.dir.join(format!("{}.head", self.base))
    }

    pub fn body_path(&self) -> PathBuf {
        self.dir.join(format!("{}.body", self.base))
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// A store rooted at `root`, or at `.cache` adjacent to the binary when
    /// unset. The directory is not created here; it appears on first write.
    pub fn new(root: Option<PathBuf>) -> Self {
        let root = root.unwrap_or_else(default_root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the entry key. The query participates only when `by_query`
    /// is set and a non-empty query exists; it is hashed verbatim, order
    /// preserved.
    pub fn key(
        &self,
        host: &str,
        path: &str,
        query: Option<&str>,
        method: &str,
        by_query: bool,
    ) -> CacheKey {
        let mut base = method.to_string();
        if by_query {
            if let Some(q) = query.filter(|q| !q.is_empty()) {
                base.push('.');
                base.push_str(&md5_hex(q.as_bytes()));
            }
        }
        CacheKey {
            dir: self.root.join(format!("{host}{path}")),
            base,
        }
    }

    /// Load the head file, or `None` when the entry is absent. A malformed
    /// head reads as a miss, never an error.
    pub async fn load_head(&self, key: &CacheKey) -> Result<Option<CacheHead>> {
        let path = key.head_path();
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(head) => Ok(Some(head)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed cache head, treating as miss");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read cache head {}", path.display()))
            }
        }
    }

    /// Freshness: `update_time + ttl*1000 >= now`, or always fresh with no TTL.
    pub fn is_fresh(head: &CacheHead, ttl_seconds: Option<u64>) -> bool {
        match ttl_seconds {
            None => true,
            Some(ttl) => head.update_time + (ttl as i64) * 1000 >= chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Open the body file for reading; `None` when absent (entry serves an
    /// empty body).
    pub async fn open_body(&self, key: &CacheKey) -> Option<fs::File> {
        fs::File::open(key.body_path()).await.ok()
    }

    /// Create the entry: the directory and head file are written before the
    /// returned body file receives any bytes.
    pub async fn create(&self, key: &CacheKey, head: &CacheHead) -> Result<fs::File> {
        fs::create_dir_all(&key.dir).await.with_context(|| {
            format!("failed to create cache entry directory {}", key.dir.display())
        })?;
        let json = serde_json::to_vec(head).context("failed to encode cache head")?;
        fs::write(key.head_path(), json)
            .await
            .with_context(|| format!("failed to write cache head {}", key.head_path().display()))?;
        let body = fs::File::create(key.body_path())
            .await
            .with_context(|| format!("failed to create cache body {}", key.body_path().display()))?;
        debug!(dir = %key.dir.display(), base = %key.base, "cache entry created");
        Ok(body)
    }

    /// Remove the whole cache directory. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to clear cache directory {}", self.root.display())),
        }
    }
}

fn default_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".cache")))
        .unwrap_or_else(|| PathBuf::from(".cache"))
}

fn md5_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(32);
    for byte in Md5::digest(data) {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Header mapping preserving multi-value semantics, for head-file JSON.
pub fn headers_to_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(v.to_string());
        }
    }
    map
}

/// Rebuild a `HeaderMap` from head-file JSON; unparseable entries are skipped.
pub fn map_to_headers(map: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}
