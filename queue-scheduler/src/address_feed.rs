use anyhow::{Context, Result};
use metrics::counter;
use queue_scheduler_core::{group_addresses, Address};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scheduler_metrics::ADDRESS_SNAPSHOTS_TOTAL;
use crate::scheduler_worker::SchedulerHandle;

/// Layout of the addresses file.
///
/// ```yaml
/// addresses:
///   - name: queue1
///     plan: pooled-inmemory
///   - name: orders
///     plan: standard
/// ```
#[derive(Debug, Deserialize, Default)]
struct AddressesFile {
    #[serde(default)]
    addresses: Vec<Address>,
}

/// Configuration feed backed by a YAML file.
///
/// The file is polled; whenever the set of addresses it lists differs from
/// the last snapshot the scheduler accepted, the full grouped snapshot is
/// pushed again. Failures (unreadable file, bad YAML, scheduler error) are
/// retried after `retry_delay`.
#[derive(Debug)]
pub struct AddressFeed {
    path: PathBuf,
    poll_interval: Duration,
    retry_delay: Duration,
    scheduler: SchedulerHandle,
    last_applied: Option<BTreeSet<Address>>,
}

impl AddressFeed {
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        retry_delay: Duration,
        scheduler: SchedulerHandle,
    ) -> Self {
        AddressFeed {
            path: path.into(),
            poll_interval,
            retry_delay,
            scheduler,
            last_applied: None,
        }
    }

    pub fn start(self) -> AddressFeedTask {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        AddressFeedTask { shutdown_tx, join }
    }

    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(path = %self.path.display(), "watching addresses file");

        loop {
            let delay = match self.poll_once().await {
                Ok(_) => self.poll_interval,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = format!("{:#}", e),
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "failed to apply addresses file"
                    );
                    self.retry_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        info!("address feed stopped");
    }

    /// Reads the file and pushes it when it changed. Returns whether a snapshot was pushed.
    pub(crate) async fn poll_once(&mut self) -> Result<bool> {
        let addresses = read_addresses(&self.path).await?;
        if self.last_applied.as_ref() == Some(&addresses) {
            return Ok(false);
        }

        let snapshot = group_addresses(addresses.iter().cloned());
        info!(
            addresses = addresses.len(),
            groups = snapshot.len(),
            "pushing address snapshot"
        );
        self.scheduler
            .addresses_changed(snapshot)
            .await
            .context("scheduler rejected the address snapshot")?;

        counter!(ADDRESS_SNAPSHOTS_TOTAL.name).increment(1);
        self.last_applied = Some(addresses);
        Ok(true)
    }
}

async fn read_addresses(path: &Path) -> Result<BTreeSet<Address>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "addresses file missing, no addresses desired");
            return Ok(BTreeSet::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    if content.trim().is_empty() {
        return Ok(BTreeSet::new());
    }

    let file: AddressesFile = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(file.addresses.into_iter().collect())
}

/// Running feed; dropping it leaves the feed running until the runtime stops.
#[derive(Debug)]
pub struct AddressFeedTask {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl AddressFeedTask {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "address feed task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler_state::{SchedulerEvent, SchedulerState};
    use crate::scheduler_worker::SchedulerWorker;
    use std::fs;
    use tempfile::TempDir;

    const TWO_POOLED: &str = "addresses:\n  - name: queue1\n    plan: pooled-inmemory\n  - name: queue2\n    plan: pooled-inmemory\n";

    #[tokio::test]
    async fn unchanged_file_is_pushed_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("addresses.yml");
        fs::write(&path, TWO_POOLED).unwrap();

        let (handle, _worker) = SchedulerWorker::spawn(SchedulerState::new());
        let mut events = handle.subscribe();
        let mut feed = AddressFeed::new(&path, Duration::from_secs(1), Duration::from_secs(1), handle);

        assert!(feed.poll_once().await.unwrap());
        assert!(!feed.poll_once().await.unwrap());

        assert_eq!(
            events.try_recv().unwrap(),
            SchedulerEvent::AddressesChanged {
                groups: vec!["pooled-inmemory".to_string()]
            }
        );
        assert!(events.try_recv().is_err());

        fs::write(
            &path,
            "addresses:\n  - name: orders\n    plan: standard\n",
        )
        .unwrap();
        assert!(feed.poll_once().await.unwrap());
        assert_eq!(
            events.try_recv().unwrap(),
            SchedulerEvent::AddressesChanged {
                groups: vec!["orders".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn missing_file_means_no_addresses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.yml");

        let (handle, _worker) = SchedulerWorker::spawn(SchedulerState::new());
        let mut events = handle.subscribe();
        let mut feed = AddressFeed::new(&path, Duration::from_secs(1), Duration::from_secs(1), handle);

        assert!(feed.poll_once().await.unwrap());
        assert_eq!(
            events.try_recv().unwrap(),
            SchedulerEvent::AddressesChanged { groups: vec![] }
        );
        assert!(!feed.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn invalid_yaml_is_retried_until_fixed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("addresses.yml");
        fs::write(&path, "addresses: [ this is not valid").unwrap();

        let (handle, _worker) = SchedulerWorker::spawn(SchedulerState::new());
        let mut events = handle.subscribe();
        let task = AddressFeed::new(
            &path,
            Duration::from_secs(60),
            Duration::from_millis(20),
            handle,
        )
        .start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(events.try_recv().is_err());

        fs::write(&path, TWO_POOLED).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SchedulerEvent::AddressesChanged { .. }));

        task.stop().await;
    }
}
