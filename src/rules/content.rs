// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Content rule: answer a matched request with a fixed value.

use crate::rules::{RequestCtx, RuleHandler, RuleResult, SynthResponse};
use anyhow::Result;
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use serde_json::Value;

pub struct ContentRule {
    value: Value,
}

impl ContentRule {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// CLI args: anything that parses as JSON keeps its structure, the rest
    /// is a plain string.
    pub fn from_args(args: &str) -> Self {
        let value = serde_json::from_str(args).unwrap_or_else(|_| Value::String(args.to_string()));
        Self::new(value)
    }

    fn render(&self) -> (String, bool) {
        match &self.value {
            Value::Object(_) | Value::Array(_) => (self.value.to_string(), true),
            Value::String(s) => (s.clone(), false),
            v => (v.to_string(), false),
        }
    }
}

#[async_trait]
impl RuleHandler for ContentRule {
    async fn on_request(&self, _req: &RequestCtx) -> Result<RuleResult> {
        let (body, structured) = self.render();
        let mut synth = SynthResponse::text(body);
        if structured {
            synth
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        Ok(RuleResult::Synth(synth))
    }
}
