// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error kinds surfaced through the proxy's error sink.

use std::sync::Arc;

/// Which subsystem produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The plain listener failed to bind or emitted an error.
    Http,
    /// The internal TLS listener errored.
    Https,
    /// The CONNECT bridge hit a non-benign socket error.
    Connect,
    /// Upstream fetch, response emission, or a rule handler failed.
    Forward,
}

/// Callback receiving every surfaced proxy error.
pub type ErrorSink = Arc<dyn Fn(ErrorKind, &anyhow::Error) + Send + Sync>;

/// Default sink: log through tracing.
pub fn log_sink() -> ErrorSink {
    Arc::new(|kind, err| tracing::error!(?kind, error = %err, "proxy error"))
}
