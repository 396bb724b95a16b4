pub mod address;
pub mod broker;
pub mod errors;
pub mod protocol;

pub use address::{group_addresses, Address};
pub use broker::BrokerHandle;
pub use errors::{Result, SchedulerError};
