mod placement;

use metrics::{counter, gauge};
use queue_scheduler_core::{Address, BrokerHandle, Result, SchedulerError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::scheduler_metrics::{BROKERS_REGISTERED, QUEUE_CREATES_TOTAL, QUEUE_DELETES_TOTAL};
use placement::LeastLoaded;

/// Full desired state pushed by the configuration feed: group id -> addresses.
pub type AddressSnapshot = HashMap<String, BTreeSet<Address>>;

const EVENTS_CAPACITY: usize = 256;

/// Notification emitted after an entry point has mutated the scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// `groups` lists the groups whose desired set was applied, in group id
    /// order. A failed snapshot lists the groups processed before the failure.
    AddressesChanged { groups: Vec<String> },
    BrokerAdded { group: String, broker_id: String },
    BrokerRemoved { group: String, broker_id: String },
}

/// SchedulerState - the scheduling engine
///
/// Tracks which brokers are connected to each group and which addresses each
/// group should host, and converges the brokers toward that desired state.
///
/// ## State:
/// - **registrations**: group -> broker id -> live broker handle. A group is
///   present only while at least one of its brokers is connected.
/// - **desired**: group -> last address snapshot received for the group.
///
/// The two maps are independent: a group may have brokers and no desired
/// addresses, or desired addresses and no brokers.
///
/// ## Placement:
/// - Groups with more than one desired address use load-balanced placement:
///   each missing address goes to the broker hosting the fewest queues.
/// - Groups with zero or one desired address use broadcast placement: the
///   address is deployed on every broker of the group.
///
/// ## Failures:
/// Broker calls are issued one at a time. The first failing call aborts the
/// rest of the batch and is returned to the caller; nothing already issued is
/// rolled back. The next event for the group re-runs placement, which checks
/// the live queue inventory again and only deploys what is still missing.
///
/// The state has a single owner (see `SchedulerWorker`), so every entry point
/// takes `&mut self` and runs to completion before the next one starts.
#[derive(Debug)]
pub struct SchedulerState {
    registrations: HashMap<String, BTreeMap<String, Arc<dyn BrokerHandle>>>,
    desired: HashMap<String, BTreeSet<Address>>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        SchedulerState {
            registrations: HashMap::new(),
            desired: HashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SchedulerEvent> {
        self.events.clone()
    }

    /// Applies a new configuration snapshot
    ///
    /// ## Process:
    /// 1. **Drop Stale Groups**: groups missing from the snapshot lose their
    ///    desired addresses. Their brokers stay registered and are not asked to
    ///    delete anything.
    /// 2. **Update Groups**: every group of the snapshot is diffed against its
    ///    previous desired set, in group id order.
    ///
    /// Receiving the same snapshot twice issues no broker calls the second time.
    pub async fn addresses_changed(&mut self, snapshot: AddressSnapshot) -> Result<()> {
        let stale: Vec<String> = self
            .desired
            .keys()
            .filter(|group| !snapshot.contains_key(*group))
            .cloned()
            .collect();

        for group in &stale {
            self.desired.remove(group);
            info!(group = %group, "group no longer has desired addresses");
        }

        let mut groups: Vec<(String, BTreeSet<Address>)> = snapshot.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));

        let mut applied = Vec::with_capacity(groups.len());
        let mut outcome = Ok(());
        for (group, addresses) in groups {
            if let Err(e) = self.group_updated(&group, addresses).await {
                outcome = Err(e);
                break;
            }
            applied.push(group);
        }

        // emitted on failure too: stale groups and the groups before the
        // failing one have already been applied
        let _ = self
            .events
            .send(SchedulerEvent::AddressesChanged { groups: applied });

        outcome
    }

    /// Diffs the group's desired set against `addresses` and issues the broker calls.
    ///
    /// The desired set is only replaced once every call succeeded, so a failed
    /// update is retried in full by the next identical snapshot.
    async fn group_updated(&mut self, group: &str, addresses: BTreeSet<Address>) -> Result<()> {
        let existing = self.desired.get(group).cloned().unwrap_or_default();

        let removed: Vec<&Address> = existing.difference(&addresses).collect();
        if !removed.is_empty() {
            if let Some(brokers) = self.registrations.get(group) {
                for (broker_id, broker) in brokers {
                    for address in &removed {
                        debug!(group = %group, broker_id = %broker_id, address = %address.name, "deleting queue");
                        broker.delete_queue(address).await?;
                        counter!(QUEUE_DELETES_TOTAL.name).increment(1);
                    }
                }
            }
        }

        let added: BTreeSet<Address> = addresses.difference(&existing).cloned().collect();
        if !added.is_empty() {
            info!(
                group = %group,
                added = added.len(),
                removed = removed.len(),
                desired = addresses.len(),
                "desired addresses changed"
            );
            if addresses.len() > 1 {
                self.deploy_balanced(group, &added).await?;
            } else {
                self.deploy_broadcast(group, &added).await?;
            }
        }

        self.desired.insert(group.to_string(), addresses);
        Ok(())
    }

    /// Registers a newly connected broker and deploys the group's addresses
    ///
    /// ## Placement:
    /// - **Single address group**: the address is created on the new broker only.
    /// - **Otherwise**: full load-balanced placement over the desired set, since
    ///   the new broker changes how the load should be spread.
    ///
    /// Fails without touching the state if `broker_id` is already registered in
    /// the group.
    pub async fn broker_added(
        &mut self,
        group: &str,
        broker_id: &str,
        broker: Arc<dyn BrokerHandle>,
    ) -> Result<()> {
        let brokers = self.registrations.entry(group.to_string()).or_default();
        if brokers.contains_key(broker_id) {
            return Err(SchedulerError::DuplicateBroker {
                group: group.to_string(),
                broker_id: broker_id.to_string(),
            });
        }
        brokers.insert(broker_id.to_string(), Arc::clone(&broker));

        info!(group = %group, broker_id = %broker_id, "broker registered");
        self.record_registrations();
        let _ = self.events.send(SchedulerEvent::BrokerAdded {
            group: group.to_string(),
            broker_id: broker_id.to_string(),
        });

        let addresses = self.desired.get(group).cloned().unwrap_or_default();
        if addresses.len() == 1 {
            for address in &addresses {
                debug!(group = %group, broker_id = %broker_id, address = %address.name, "creating queue");
                broker.create_queue(address).await?;
                counter!(QUEUE_CREATES_TOTAL.name).increment(1);
            }
            Ok(())
        } else {
            self.deploy_balanced(group, &addresses).await
        }
    }

    /// Deregisters a broker whose connection went away
    ///
    /// Unknown brokers are ignored. When the group has more than one desired
    /// address the remaining brokers are rebalanced so the queues lost with the
    /// departed broker get recreated.
    pub async fn broker_removed(&mut self, group: &str, broker_id: &str) -> Result<()> {
        let Some(brokers) = self.registrations.get_mut(group) else {
            return Ok(());
        };
        if brokers.remove(broker_id).is_none() {
            return Ok(());
        }
        if brokers.is_empty() {
            self.registrations.remove(group);
            debug!(group = %group, "last broker of the group is gone");
        }

        info!(group = %group, broker_id = %broker_id, "broker deregistered");
        self.record_registrations();
        let _ = self.events.send(SchedulerEvent::BrokerRemoved {
            group: group.to_string(),
            broker_id: broker_id.to_string(),
        });

        let addresses = self.desired.get(group).cloned().unwrap_or_default();
        if addresses.len() > 1 {
            self.deploy_balanced(group, &addresses).await?;
        }
        Ok(())
    }

    /// Load-balanced placement
    ///
    /// ## Process:
    /// 1. **Inventory**: asks every broker for its queues; an address already
    ///    hosted by any broker of the group is never deployed again.
    /// 2. **Ranking**: brokers are ranked by queue count, lowest first, ties
    ///    broken by broker id.
    /// 3. **Assignment**: each remaining address goes to the least loaded broker,
    ///    whose count is bumped before the next address is placed.
    ///
    /// Existing queues are never moved.
    async fn deploy_balanced(&self, group: &str, addresses: &BTreeSet<Address>) -> Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }
        let Some(brokers) = self.registrations.get(group) else {
            return Ok(());
        };

        let mut to_place: Vec<&Address> = addresses.iter().collect();
        let mut ranking = LeastLoaded::default();

        for (broker_id, broker) in brokers {
            let queues = broker.queue_names().await?;
            to_place.retain(|address| !queues.contains(&address.name));
            ranking.push(broker_id.as_str(), queues.len());
        }

        for address in to_place {
            let Some(mut least_loaded) = ranking.pop() else {
                break;
            };
            let Some(broker) = brokers.get(least_loaded.broker_id) else {
                warn!(broker_id = %least_loaded.broker_id, "ranked broker is not registered");
                continue;
            };

            debug!(
                group = %group,
                broker_id = %least_loaded.broker_id,
                queues = least_loaded.queue_count,
                address = %address.name,
                "creating queue on least loaded broker"
            );
            broker.create_queue(address).await?;
            counter!(QUEUE_CREATES_TOTAL.name).increment(1);

            least_loaded.queue_count += 1;
            ranking.push(least_loaded.broker_id, least_loaded.queue_count);
        }

        Ok(())
    }

    /// Broadcast placement: every address goes to every broker of the group.
    async fn deploy_broadcast(&self, group: &str, addresses: &BTreeSet<Address>) -> Result<()> {
        let Some(brokers) = self.registrations.get(group) else {
            return Ok(());
        };

        for address in addresses {
            for (broker_id, broker) in brokers {
                debug!(group = %group, broker_id = %broker_id, address = %address.name, "creating queue");
                broker.create_queue(address).await?;
                counter!(QUEUE_CREATES_TOTAL.name).increment(1);
            }
        }
        Ok(())
    }

    /// Ids of the brokers registered in `group`, in id order.
    pub fn broker_ids(&self, group: &str) -> Vec<String> {
        self.registrations
            .get(group)
            .map(|brokers| brokers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn desired_addresses(&self, group: &str) -> Option<&BTreeSet<Address>> {
        self.desired.get(group)
    }

    /// Groups that currently have at least one registered broker.
    pub fn registered_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.registrations.keys().cloned().collect();
        groups.sort();
        groups
    }

    fn registered_brokers(&self) -> usize {
        self.registrations.values().map(BTreeMap::len).sum()
    }

    fn record_registrations(&self) {
        gauge!(BROKERS_REGISTERED.name).set(self.registered_brokers() as f64);
    }
}

// Tests for SchedulerState are in scheduler_state_test.rs
#[cfg(test)]
#[path = "scheduler_state_test.rs"]
mod tests;
