// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Rule pattern compilation and matching.

use anyhow::{Context, Result};
use regex::Regex;

/// A compiled rule pattern, tested against `host + path-with-query`.
///
/// A pattern containing a `(...)` group compiles as a regex. Anything else
/// is a glob-ish string: a leading `http://` or `https://` is stripped and
/// each `*` matches lazily across segments. No anchoring is applied;
/// pattern authors anchor with `^`/`$` themselves.
pub struct Matcher {
    pattern: String,
    re: Regex,
}

impl Matcher {
    /// Compile once at rule-add time, not per request.
    pub fn compile(pattern: &str) -> Result<Self> {
        let re = if pattern.contains('(') && pattern.contains(')') {
            Regex::new(pattern).with_context(|| format!("invalid regex pattern: {pattern}"))?
        } else {
            let stripped = pattern
                .strip_prefix("http://")
                .or_else(|| pattern.strip_prefix("https://"))
                .unwrap_or(pattern);
            let escaped: Vec<String> = stripped.split('*').map(|s| regex::escape(s)).collect();
            Regex::new(&escaped.join(".*?"))
                .with_context(|| format!("invalid wildcard pattern: {pattern}"))?
        };
        Ok(Self {
            pattern: pattern.to_string(),
            re,
        })
    }

    /// Build a matcher from an already-compiled regex (embedder API).
    pub fn from_regex(re: Regex) -> Self {
        Self {
            pattern: re.as_str().to_string(),
            re,
        }
    }

    pub fn matches(&self, target: &str) -> bool {
        self.re.is_match(target)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}
