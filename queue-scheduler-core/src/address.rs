use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display, Formatter};

/// Plans starting with this prefix share a pool of brokers per plan.
pub const POOLED_PLAN_PREFIX: &str = "pooled";

/// A queue that has to be hosted by the brokers of one group.
///
/// Addresses are ordered by `(name, plan)`, which is also the order in which
/// a desired set is walked during placement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub plan: String,
}

impl Address {
    pub fn new(name: impl Into<String>, plan: impl Into<String>) -> Self {
        Address {
            name: name.into(),
            plan: plan.into(),
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.plan.starts_with(POOLED_PLAN_PREFIX)
    }

    /// The scheduling group the address belongs to.
    ///
    /// Pooled addresses are grouped by plan, every other address gets a
    /// dedicated group named after itself.
    pub fn group_id(&self) -> &str {
        if self.is_pooled() {
            &self.plan
        } else {
            &self.name
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.plan)
    }
}

/// Builds a full configuration snapshot (group -> desired addresses) from a flat list.
pub fn group_addresses<I>(addresses: I) -> HashMap<String, BTreeSet<Address>>
where
    I: IntoIterator<Item = Address>,
{
    let mut snapshot: HashMap<String, BTreeSet<Address>> = HashMap::new();
    for address in addresses {
        snapshot
            .entry(address.group_id().to_string())
            .or_default()
            .insert(address);
    }
    snapshot
}
