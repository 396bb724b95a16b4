mod args_parse;

use anyhow::{Context, Result};
use clap::Parser;
use std::{fs::read_to_string, net::SocketAddr, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::args_parse::Args;
use queue_scheduler::{
    auth::Authenticator,
    scheduler_metrics::init_metrics,
    service_configuration::{FeedSettings, LoadConfiguration, ServiceConfiguration},
    tls::load_tls_acceptor,
    AddressFeed, RemoteBrokerFactory, SchedulerServer, SchedulerState, SchedulerWorker,
    ServerOptions,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse command line arguments
    let args = Args::parse();

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(&args.config_file)
        .with_context(|| format!("Failed to read {}", args.config_file.display()))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;

    // Attempt to transform LoadConfiguration into ServiceConfiguration
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    if let Some(listen_addr) = args.listen_addr {
        service_config.listen_addr = listen_addr.parse().context(format!(
            "Failed to parse into Socket address: {}",
            listen_addr
        ))?;
    }

    if let Some(tls_dir) = args.tls_dir {
        service_config.tls_dir = Some(tls_dir);
    }

    if let Some(file) = args.addresses_file {
        match service_config.address_feed.as_mut() {
            Some(feed) => feed.file = file,
            None => service_config.address_feed = Some(FeedSettings::with_file(file)),
        }
    }

    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_exporter
        ))?;
        service_config.prom_exporter = Some(prom_address);
    }

    // Init metrics with or without prometheus exporter
    init_metrics(service_config.prom_exporter)?;

    let tls = match service_config.tls_dir.as_deref() {
        Some(dir) => Some(load_tls_acceptor(dir)?),
        None => {
            warn!("no TLS directory configured, brokers connect over plain TCP");
            None
        }
    };
    let authenticator: Arc<dyn Authenticator> = service_config.auth.authenticator()?;

    let (scheduler, worker) = SchedulerWorker::spawn(SchedulerState::new());

    let mut server = SchedulerServer::new(
        ServerOptions {
            listen_addr: service_config.listen_addr,
            handshake_timeout: service_config.handshake_timeout,
        },
        Arc::new(RemoteBrokerFactory::new(service_config.rpc_timeout)),
        scheduler.clone(),
        authenticator,
        tls,
    );
    server
        .start()
        .await
        .context("Failed to start the broker listener")?;

    let feed = match service_config.address_feed {
        Some(settings) => Some(
            AddressFeed::new(
                settings.file,
                settings.poll_interval,
                settings.retry_delay,
                scheduler.clone(),
            )
            .start(),
        ),
        None => {
            warn!("no address feed configured, no queues will be placed");
            None
        }
    };

    info!(port = server.port(), "queue scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("shutdown requested");

    server.stop().await;
    if let Some(feed) = feed {
        feed.stop().await;
    }
    scheduler.shutdown().await;
    worker.await?;

    info!("queue scheduler stopped");
    Ok(())
}
