// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Delay rule: hold a matched request before passing it upstream.

use crate::rules::{RequestCtx, RuleHandler, RuleResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub struct DelayRule {
    delay_ms: i64,
}

impl DelayRule {
    pub fn new(delay_ms: i64) -> Self {
        Self { delay_ms }
    }

    pub fn from_args(args: &str) -> Result<Self> {
        let delay_ms = args
            .trim()
            .parse()
            .with_context(|| format!("delay rule wants milliseconds, got: {args}"))?;
        Ok(Self::new(delay_ms))
    }
}

#[async_trait]
impl RuleHandler for DelayRule {
    async fn on_request(&self, req: &RequestCtx) -> Result<RuleResult> {
        if self.delay_ms > 0 {
            debug!(seq = req.seq, delay_ms = self.delay_ms, "delaying request");
            tokio::time::sleep(Duration::from_millis(self.delay_ms as u64)).await;
        }
        Ok(RuleResult::Passthrough)
    }
}
