// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;

use devproxy::{config, proxy, rules};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "devproxy")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(long)]
    listen: Option<String>,

    /// Rule string `name|pattern|args`; repeatable, evaluated in order
    #[arg(long = "rule", value_name = "RULE")]
    rules: Vec<String>,

    /// PEM private key of the root CA used to mint interception certificates
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// PEM certificate of the root CA
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Root directory for cache rules (default: .cache next to the binary)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Journal intercepted traffic to an inspection directory
    #[arg(long)]
    inspect: bool,

    /// Inspection directory (default: fresh temp dir)
    #[arg(long)]
    inspect_dir: Option<PathBuf>,

    /// Keep the inspection temp dir after exit
    #[arg(long)]
    keep: bool,

    /// Optional config TOML path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let cfg = if let Some(ref p) = args.config {
        config::Config::load_from_path(p).await.unwrap_or_else(|e| {
            warn!(path = %p.display(), %e, "failed to load config, using defaults");
            config::Config::default()
        })
    } else {
        config::Config::default()
    };

    let listen: SocketAddr = args
        .listen
        .as_deref()
        .unwrap_or(&cfg.general.listen)
        .parse()?;

    let cache_dir = args
        .cache_dir
        .or_else(|| cfg.cache.dir.as_ref().map(PathBuf::from));

    let mut builder = proxy::ProxyServer::builder().listen(listen);

    for spec in cfg.rules.iter().chain(args.rules.iter()) {
        let rule = rules::parse_rule(spec, cache_dir.clone())?;
        info!(rule = %spec, "rule registered");
        builder = builder.rule(rule);
    }

    let ca_key = args
        .ca_key
        .or_else(|| cfg.tls.ca_key_path.as_ref().map(PathBuf::from));
    let ca_cert = args
        .ca_cert
        .or_else(|| cfg.tls.ca_cert_path.as_ref().map(PathBuf::from));
    match (ca_key, ca_cert) {
        (Some(key), Some(cert)) => {
            builder = builder.root_ca_files(key, cert);
        }
        (Some(_), None) | (None, Some(_)) => {
            warn!("root CA needs both --ca-key and --ca-cert; https interception disabled");
        }
        (None, None) => {}
    }

    if args.inspect || cfg.inspect.enabled {
        let dir = args
            .inspect_dir
            .or_else(|| cfg.inspect.dir.as_ref().map(PathBuf::from));
        builder = builder.inspect(dir, args.keep || cfg.inspect.keep);
    }

    let server = builder.build().await?;

    tokio::select! {
        res = server.run() => {
            if let Err(e) = res {
                error!(%e, "server error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
