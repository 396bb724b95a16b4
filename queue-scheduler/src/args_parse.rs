use clap::Parser;
use std::path::PathBuf;

/// Places queues on the brokers that connect to it and keeps them balanced.
#[derive(Parser, Debug, Clone)]
#[command(name = "queue-scheduler", version)]
pub(crate) struct Args {
    /// Path to the YAML config file
    #[arg(long)]
    pub(crate) config_file: PathBuf,

    /// Address accepting broker connections, overrides scheduler.host/port
    #[arg(long)]
    pub(crate) listen_addr: Option<String>,

    /// Directory with tls.key, tls.crt and ca.crt, overrides scheduler.tls_dir
    #[arg(long)]
    pub(crate) tls_dir: Option<PathBuf>,

    /// YAML file listing the desired addresses, overrides address_feed.file
    #[arg(long)]
    pub(crate) addresses_file: Option<PathBuf>,

    /// Prometheus exporter http address
    #[arg(long)]
    pub(crate) prom_exporter: Option<String>,
}
