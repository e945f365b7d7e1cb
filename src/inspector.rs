// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Request/response journaling: an indexed `index.json` plus raw body files.

use crate::rules::ResponseHead;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Journal writes coalesce: a burst of updates produces one flush, no
/// earlier than this after the first pending update.
const FLUSH_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEntry {
    pub url: String,
    pub method: String,
    pub version: String,
    pub headers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEntry {
    pub status: u16,
    #[serde(rename = "statusMessage", skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub headers: HashMap<String, Vec<String>>,
}

/// One journal record per intercepted request, indexed by `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub seq: u64,
    pub req: RequestEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res: Option<ResponseEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

/// Observer persisting a journal of intercepted traffic. Bodies append to
/// `<seq>.req` / `<seq>.res` as they flow; entries land in `index.json`
/// through the coalescing flush timer.
pub struct Inspector {
    dir: PathBuf,
    keep: bool,
    entries: Mutex<Vec<Option<Entry>>>,
    flush_pending: AtomicBool,
}

impl Inspector {
    /// Journal into `dir`, or into a fresh temp directory when unset.
    /// `keep` controls whether the directory survives drop.
    pub async fn new(dir: Option<PathBuf>, keep: bool) -> Result<Arc<Self>> {
        let dir = dir.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("devproxy-inspect-{}", Uuid::new_v4()))
        });
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create inspector directory {}", dir.display()))?;
        info!(dir = %dir.display(), keep, "inspector enabled");
        Ok(Arc::new(Self {
            dir,
            keep,
            entries: Mutex::new(Vec::new()),
            flush_pending: AtomicBool::new(false),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn on_request(self: &Arc<Self>, seq: u64, req: RequestEntry, rule: Option<String>) {
        let mut entries = self.entries.lock().unwrap();
        let idx = seq as usize;
        if entries.len() <= idx {
            entries.resize_with(idx + 1, || None);
        }
        entries[idx] = Some(Entry {
            seq,
            req,
            res: None,
            rule,
        });
        drop(entries);
        self.schedule_flush();
    }

    pub fn on_respond(self: &Arc<Self>, seq: u64, head: &ResponseHead) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(Some(entry)) = entries.get_mut(seq as usize) {
            entry.res = Some(ResponseEntry {
                status: head.status.as_u16(),
                status_message: head.status_message.clone(),
                headers: crate::cache::headers_to_map(&head.headers),
            });
        }
        drop(entries);
        self.schedule_flush();
    }

    pub fn on_request_end(&self, seq: u64) {
        debug!(seq, "request body complete");
    }

    pub fn on_response_end(&self, seq: u64) {
        debug!(seq, "response body complete");
    }

    /// Open the raw request-body file for this `seq`.
    pub async fn req_body_file(&self, seq: u64) -> Result<fs::File> {
        self.body_file(seq, "req").await
    }

    /// Open the raw response-body file for this `seq`.
    pub async fn res_body_file(&self, seq: u64) -> Result<fs::File> {
        self.body_file(seq, "res").await
    }

    async fn body_file(&self, seq: u64, ext: &str) -> Result<fs::File> {
        let path = self.dir.join(format!("{seq}.{ext}"));
        fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create body file {}", path.display()))
    }

    fn schedule_flush(self: &Arc<Self>) {
        if self.flush_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DELAY).await;
            // clear first so updates landing mid-write schedule another pass
            this.flush_pending.store(false, Ordering::SeqCst);
            if let Err(e) = this.flush().await {
                warn!(error = %e, "failed to write inspector journal");
            }
        });
    }

    /// Write the journal now, bypassing the coalescing timer.
    pub async fn flush(&self) -> Result<()> {
        let json = {
            let entries = self.entries.lock().unwrap();
            serde_json::to_vec_pretty(&*entries).context("failed to encode inspector journal")?
        };
        let path = self.dir.join("index.json");
        fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Snapshot of the journal entry at `seq`, if any.
    pub fn entry(&self, seq: u64) -> Option<Entry> {
        self.entries
            .lock()
            .unwrap()
            .get(seq as usize)
            .and_then(|e| e.clone())
    }
}

impl Drop for Inspector {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderMap;
    use hyper::StatusCode;

    fn req_entry(url: &str) -> RequestEntry {
        RequestEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: HashMap::new(),
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("devproxy_insp_{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn entries_index_by_seq() {
        let insp = Inspector::new(Some(temp_dir()), false).await.unwrap();
        insp.on_request(3, req_entry("http://x/three"), Some("content".into()));

        let entry = insp.entry(3).expect("entry at seq");
        assert_eq!(entry.seq, 3);
        assert_eq!(entry.req.url, "http://x/three");
        assert_eq!(entry.rule.as_deref(), Some("content"));
        assert!(entry.res.is_none());
        assert!(insp.entry(1).is_none());
        assert!(insp.entry(2).is_none());
    }

    #[tokio::test]
    async fn respond_fills_response_metadata() {
        let insp = Inspector::new(Some(temp_dir()), false).await.unwrap();
        insp.on_request(1, req_entry("http://x/"), None);

        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        insp.on_respond(1, &ResponseHead::new(StatusCode::OK, headers));

        let entry = insp.entry(1).unwrap();
        let res = entry.res.expect("response recorded");
        assert_eq!(res.status, 200);
        assert_eq!(res.status_message.as_deref(), Some("OK"));
        assert_eq!(res.headers["content-type"], vec!["text/plain"]);
    }

    #[tokio::test(start_paused = true)]
    async fn journal_flush_coalesces_updates() {
        let insp = Inspector::new(Some(temp_dir()), false).await.unwrap();
        let index = insp.dir().join("index.json");

        insp.on_request(1, req_entry("http://x/a"), None);
        insp.on_request(2, req_entry("http://x/b"), None);

        // nothing on disk before the coalescing window elapses
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!index.exists());

        tokio::time::sleep(Duration::from_millis(1600)).await;
        // flush task has fired; wait for the write to land
        let mut tries = 0;
        while !index.exists() && tries < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tries += 1;
        }
        let raw = fs::read(&index).await.expect("journal flushed");
        let journal: Vec<Option<Entry>> = serde_json::from_slice(&raw).unwrap();
        assert!(journal[0].is_none());
        assert_eq!(journal[1].as_ref().unwrap().req.url, "http://x/a");
        assert_eq!(journal[2].as_ref().unwrap().req.url, "http://x/b");
    }

    #[tokio::test]
    async fn body_files_use_seq_names() {
        use tokio::io::AsyncWriteExt;

        let insp = Inspector::new(Some(temp_dir()), false).await.unwrap();
        let mut f = insp.req_body_file(7).await.unwrap();
        f.write_all(b"payload").await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        let bytes = fs::read(insp.dir().join("7.req")).await.unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn temp_dir_removed_unless_kept() {
        let insp = Inspector::new(None, false).await.unwrap();
        let dir = insp.dir().to_path_buf();
        assert!(dir.exists());
        drop(insp);
        assert!(!dir.exists());

        let kept_dir = temp_dir();
        let insp = Inspector::new(Some(kept_dir.clone()), true).await.unwrap();
        drop(insp);
        assert!(kept_dir.exists());
        let _ = std::fs::remove_dir_all(&kept_dir);
    }
}
