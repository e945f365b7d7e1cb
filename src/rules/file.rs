// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! File rule: serve a matched request from a file on disk.

use crate::rules::{RequestCtx, RuleHandler, RuleResult, SynthResponse};
use anyhow::Result;
use async_trait::async_trait;
use hyper::{Body, StatusCode};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub struct FileRule {
    path: PathBuf,
}

impl FileRule {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl RuleHandler for FileRule {
    async fn on_request(&self, req: &RequestCtx) -> Result<RuleResult> {
        match tokio::fs::File::open(&self.path).await {
            Ok(file) => {
                debug!(seq = req.seq, path = %self.path.display(), "serving file");
                Ok(RuleResult::Synth(
                    SynthResponse::new(StatusCode::OK)
                        .with_body(Body::wrap_stream(ReaderStream::new(file))),
                ))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Ok(RuleResult::Synth(SynthResponse::new(StatusCode::NOT_FOUND)))
            }
            Err(e) => Ok(RuleResult::Fail(anyhow::Error::new(e).context(format!(
                "failed to open {}",
                self.path.display()
            )))),
        }
    }
}
