// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading: TOML file mirroring the CLI flags.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Listen address, e.g. 127.0.0.1:8080
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsConfig {
    pub ca_key_path: Option<String>,
    pub ca_cert_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CacheConfig {
    /// Root directory for cache rules (default: `.cache` next to the binary).
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct InspectConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Journal directory (default: fresh temp dir).
    pub dir: Option<String>,
    /// Keep the journal directory after exit.
    #[serde(default)]
    pub keep: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub inspect: InspectConfig,

    /// Rule strings `name|pattern|args`, evaluated in order.
    #[serde(default)]
    pub rules: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// ```toml
    /// [general]
    /// listen = "127.0.0.1:8080"
    ///
    /// [tls]
    /// ca_key_path = "ca.key"
    /// ca_cert_path = "ca.crt"
    ///
    /// rules = ["content|/hello|world", "cache|/img|60"]
    /// ```
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let s = tokio::fs::read_to_string(path.as_ref()).await?;
        let cfg: Self = toml::from_str(&s)?;
        Ok(cfg)
    }
}
