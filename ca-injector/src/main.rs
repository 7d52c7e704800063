/// Mutating admission webhook that mounts a CA bundle into annotated pods.
use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};

use config::{Args, CaBundleConfig};
use provision::{HttpBundleSource, KubeConfigMaps, Provisioner};
use review::{routes, Webhook};

mod config;
mod error;
mod mutate;
mod patch;
mod provision;
mod review;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse the CLI arguments
    let args = Args::try_parse()?;

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(if args.debug { Level::DEBUG } else { Level::INFO })
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Parsed CLI arguments: {:?}", args);

    let config = CaBundleConfig::resolve(&args).context("Invalid configuration")?;
    info!(
        "Injecting ConfigMap {} at {} for pods annotated {}=\"true\"",
        config.configmap_name,
        config.mount_path(),
        config.annotation
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let source = HttpBundleSource::new(Duration::from_secs(args.fetch_timeout_secs))
        .context("Failed to create HTTP client")?;
    let webhook = Arc::new(Webhook::new(
        config,
        Provisioner::new(KubeConfigMaps::new(client), source),
    ));

    info!("Starting webhook server on port {}", args.port);
    let (_addr, server) = warp::serve(routes(webhook))
        .tls()
        .cert_path(&args.tls_cert)
        .key_path(&args.tls_key)
        .bind_with_graceful_shutdown(([0, 0, 0, 0], args.port), async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for CTRL+C: {}", err);
            }
        });
    server.await;

    info!("Exiting admission server");

    Ok(())
}
