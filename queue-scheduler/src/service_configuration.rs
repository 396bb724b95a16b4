use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::AuthConfig;

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Listener configuration for broker connections
    pub scheduler: SchedulerConfig,
    /// Settings applied to every broker handle
    #[serde(default)]
    pub brokers: BrokersConfig,
    /// File based configuration feed; without it no addresses are ever desired
    pub address_feed: Option<AddressFeedConfig>,
    /// Authentication of connecting brokers
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hostname or IP address the listeners bind to
    pub host: String,
    /// Port accepting broker connections
    pub port: u16,
    /// Directory holding tls.key, tls.crt and ca.crt; plain TCP when unset
    pub tls_dir: Option<PathBuf>,
    /// Prometheus exporter port (optional)
    pub prometheus_port: Option<u16>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokersConfig {
    /// Timeout of a single broker management call
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for BrokersConfig {
    fn default() -> Self {
        BrokersConfig {
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AddressFeedConfig {
    /// YAML file listing the desired addresses
    pub file: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay before retrying after a failed read or push
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_rpc_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

/// configuration the scheduler runs with, after validation
#[derive(Debug, Clone)]
pub struct ServiceConfiguration {
    /// Address accepting broker connections
    pub listen_addr: SocketAddr,
    /// Prometheus exporter address
    pub prom_exporter: Option<SocketAddr>,
    pub tls_dir: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub rpc_timeout: Duration,
    pub address_feed: Option<FeedSettings>,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub file: PathBuf,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
}

impl FeedSettings {
    /// Feed on `file` with the default poll interval and retry delay.
    pub fn with_file(file: PathBuf) -> Self {
        FeedSettings {
            file,
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            retry_delay: Duration::from_millis(default_retry_delay_ms()),
        }
    }
}

impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let listen_addr: SocketAddr = format!("{}:{}", config.scheduler.host, config.scheduler.port)
            .parse()
            .context("Failed to create listen_addr")?;

        let prom_exporter = match config.scheduler.prometheus_port {
            Some(port) => Some(
                format!("{}:{}", config.scheduler.host, port)
                    .parse()
                    .context("Failed to create prom_exporter")?,
            ),
            None => None,
        };

        let handshake_timeout = non_zero_millis(
            "scheduler.handshake_timeout_ms",
            config.scheduler.handshake_timeout_ms,
        )?;
        let rpc_timeout =
            non_zero_millis("brokers.rpc_timeout_ms", config.brokers.rpc_timeout_ms)?;

        let address_feed = match config.address_feed {
            Some(feed) => Some(FeedSettings {
                poll_interval: non_zero_millis(
                    "address_feed.poll_interval_ms",
                    feed.poll_interval_ms,
                )?,
                retry_delay: non_zero_millis(
                    "address_feed.retry_delay_ms",
                    feed.retry_delay_ms,
                )?,
                file: feed.file,
            }),
            None => None,
        };

        // fail at startup rather than on the first broker connection
        config.auth.authenticator()?;

        Ok(ServiceConfiguration {
            listen_addr,
            prom_exporter,
            tls_dir: config.scheduler.tls_dir,
            handshake_timeout,
            rpc_timeout,
            address_feed,
            auth: config.auth,
        })
    }
}

fn non_zero_millis(field: &str, millis: u64) -> Result<Duration> {
    if millis == 0 {
        bail!("{} must be greater than zero", field);
    }
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMode;

    #[test]
    fn full_configuration_is_converted() {
        let yaml = r#"
scheduler:
  host: 127.0.0.1
  port: 5671
  tls_dir: /etc/queue-scheduler/tls
  prometheus_port: 9040
brokers:
  rpc_timeout_ms: 2000
address_feed:
  file: /etc/queue-scheduler/addresses.yml
  poll_interval_ms: 1000
auth:
  mode: shared_secret
  secret: s3cret
"#;
        let load: LoadConfiguration = serde_yaml::from_str(yaml).unwrap();
        let config = ServiceConfiguration::try_from(load).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:5671".parse().unwrap());
        assert_eq!(config.prom_exporter, Some("127.0.0.1:9040".parse().unwrap()));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.rpc_timeout, Duration::from_secs(2));
        assert_eq!(config.auth.mode, AuthMode::SharedSecret);

        let feed = config.address_feed.unwrap();
        assert_eq!(feed.poll_interval, Duration::from_secs(1));
        assert_eq!(feed.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn minimal_configuration_uses_defaults() {
        let load: LoadConfiguration =
            serde_yaml::from_str("scheduler:\n  host: 0.0.0.0\n  port: 5672\n").unwrap();
        let config = ServiceConfiguration::try_from(load).unwrap();

        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert!(config.tls_dir.is_none());
        assert!(config.address_feed.is_none());
        assert_eq!(config.auth.mode, AuthMode::None);
    }

    #[test]
    fn zero_durations_are_rejected() {
        let load: LoadConfiguration = serde_yaml::from_str(
            "scheduler:\n  host: 0.0.0.0\n  port: 5672\nbrokers:\n  rpc_timeout_ms: 0\n",
        )
        .unwrap();
        let err = ServiceConfiguration::try_from(load).unwrap_err();
        assert!(err.to_string().contains("brokers.rpc_timeout_ms"));
    }

    #[test]
    fn bad_host_is_rejected() {
        let load: LoadConfiguration =
            serde_yaml::from_str("scheduler:\n  host: not an ip\n  port: 5672\n").unwrap();
        assert!(ServiceConfiguration::try_from(load).is_err());
    }
}
