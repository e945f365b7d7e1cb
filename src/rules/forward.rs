// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Forward rule: redirect a matched request to a different origin.

use crate::rules::{RequestCtx, RuleHandler, RuleResult};
use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use hyper::Uri;
use tracing::debug;

pub struct ForwardRule {
    target: Uri,
}

impl ForwardRule {
    pub fn new(target: Uri) -> Self {
        Self { target }
    }

    pub fn from_args(args: &str) -> Result<Self> {
        let target: Uri = args
            .trim()
            .parse()
            .with_context(|| format!("forward rule wants an absolute URL, got: {args}"))?;
        ensure!(
            target.scheme().is_some() && target.authority().is_some(),
            "forward rule wants an absolute URL, got: {args}"
        );
        Ok(Self::new(target))
    }
}

#[async_trait]
impl RuleHandler for ForwardRule {
    async fn on_request(&self, req: &RequestCtx) -> Result<RuleResult> {
        debug!(seq = req.seq, target = %self.target, "forwarding to new origin");
        Ok(RuleResult::Redirect(self.target.clone()))
    }
}
