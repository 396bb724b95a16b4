pub mod address_feed;
pub mod auth;
pub mod remote_broker;
pub mod scheduler_metrics;
pub mod scheduler_server;
pub mod scheduler_state;
pub mod scheduler_worker;
pub mod service_configuration;
pub mod tls;

pub use address_feed::{AddressFeed, AddressFeedTask};
pub use remote_broker::{BrokerConnection, BrokerFactory, RemoteBroker, RemoteBrokerFactory};
pub use scheduler_server::{SchedulerServer, ServerOptions};
pub use scheduler_state::{AddressSnapshot, SchedulerEvent, SchedulerState};
pub use scheduler_worker::{SchedulerHandle, SchedulerWorker};
