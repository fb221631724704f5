//! Binary entry point: wire configuration into a running proxy.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use compy::config::{Args, Config};
use compy::error::CompyError;
use compy::proxy::Proxy;
use compy::transcode::{Gif, Identity, Jpeg, Minifier, Png, Transcoder, Zip};

#[tokio::main]
async fn main() -> Result<(), CompyError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "compy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(Args::parse())?;

    // Publish the CA so clients can fetch and trust it; without MITM the
    // proxy's own certificate is the next best thing to expose.
    let public_cert = config.ca.clone().or_else(|| config.cert.clone());
    let mut proxy = Proxy::new(config.host.clone(), public_cert);

    proxy.set_authentication(&config.user, &config.pass);

    if let (Some(ca), Some(cakey)) = (&config.ca, &config.cakey) {
        if let Err(e) = proxy.enable_mitm(ca, cakey) {
            tracing::warn!(error = %e, "not using mitm");
        }
    }

    if config.jpeg != 0 {
        proxy.add_transcoder("image/jpeg", Arc::new(Jpeg::new(config.jpeg)));
    }
    if config.gif {
        proxy.add_transcoder("image/gif", Arc::new(Gif));
    }
    if config.png {
        proxy.add_transcoder("image/png", Arc::new(Png));
    }

    let text: Arc<dyn Transcoder> = if config.minify {
        Arc::new(Zip::new(Arc::new(Minifier), config.brotli, config.gzip, false))
    } else {
        Arc::new(Zip::new(Arc::new(Identity), config.brotli, config.gzip, true))
    };
    for content_type in [
        "text/css",
        "text/html",
        "text/javascript",
        "application/javascript",
        "application/x-javascript",
    ] {
        proxy.add_transcoder(content_type, Arc::clone(&text));
    }

    let stats = proxy.stats();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let read = stats.read_total();
            let written = stats.written_total();
            let pct = if read > 0 {
                written as f64 / read as f64 * 100.0
            } else {
                100.0
            };
            tracing::info!("compy exiting, total transcoded: {read} -> {written} ({pct:3.1}%)");
            std::process::exit(0);
        }
    });

    let addr = tokio::net::lookup_host(&config.host)
        .await?
        .next()
        .ok_or_else(|| CompyError::Address(format!("cannot resolve {}", config.host)))?;
    tracing::info!(host = %config.host, "compy listening");

    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => proxy.start_tls(addr, cert, key).await,
        _ => proxy.start(addr).await,
    }
}
