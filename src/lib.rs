// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP/HTTPS proxy for local web development.
//!
//! Requests are matched against an ordered rule set and answered by
//! forwarding, synthesis, redirection, delay, or an on-disk cache. HTTPS
//! interception mints per-host certificates under a user-supplied root CA
//! and bridges CONNECT traffic into an internal TLS listener.

pub mod ca;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inspector;
pub mod matcher;
pub mod proxy;
pub mod rules;

// Keep the library surface small; main.rs remains the binary entrypoint.
