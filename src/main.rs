use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cache;
mod cert;
mod config;
mod corpus;
mod error;
mod fingerprint;
mod proxy;
mod render;
mod scan;
mod site;
mod warning;

use cache::VerdictCache;
use cert::IssuingCa;
use config::Config;
use corpus::Corpus;
use proxy::ProxyServer;
use render::WkHtmlToImage;
use scan::Scanner;
use site::SuffixList;

/// Intercepting forward proxy that blocks pages impersonating sites it has
/// already fingerprinted.
#[derive(Parser, Debug)]
#[command(name = "phisherman", version, about)]
struct Args {
    /// Path to a JSON configuration overlay.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the configuration file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the public suffix list.
    #[arg(long)]
    suffix_list: Option<PathBuf>,

    /// Path to the fingerprint database.
    #[arg(long)]
    corpus: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(path) = args.suffix_list {
        config.suffix_list_path = path;
    }
    if let Some(path) = args.corpus {
        config.corpus_path = path;
    }
    let config = Arc::new(config);

    let version = WkHtmlToImage::probe_version()
        .await
        .context("wkhtmltoimage is required but could not be executed")?;
    info!(version = %version, "wkhtmltoimage available");

    let suffixes = Arc::new(
        SuffixList::load(&config.suffix_list_path).with_context(|| {
            format!(
                "loading public suffix list from {}",
                config.suffix_list_path.display()
            )
        })?,
    );
    info!(suffixes = suffixes.len(), "public suffix list loaded");

    let corpus = Corpus::open(&config.corpus_path)
        .await
        .with_context(|| format!("opening corpus at {}", config.corpus_path.display()))?;

    let certificates = Arc::new(
        IssuingCa::load_or_generate(&config.ca_cert_path, &config.ca_key_path)
            .context("preparing interception CA")?,
    );

    let cache = Arc::new(VerdictCache::new());
    cache::spawn_janitors(Arc::clone(&cache), &config.cache);

    let renderer = Arc::new(WkHtmlToImage::new(
        config.viewport_height,
        config.timeouts.render(),
    ));
    let scanner = Arc::new(
        Scanner::new(
            corpus,
            Arc::clone(&cache),
            renderer,
            Arc::clone(&config),
        )
        .context("building detection pipeline")?,
    );

    let server = Arc::new(ProxyServer::new(
        config,
        cache,
        scanner,
        suffixes,
        certificates,
    )?);
    server.run().await.context("proxy listener failed")?;
    Ok(())
}
