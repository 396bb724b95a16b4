use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 5] = [
    QUEUE_CREATES_TOTAL,
    QUEUE_DELETES_TOTAL,
    PLACEMENT_FAILURES_TOTAL,
    CONNECTIONS_TOTAL,
    ADDRESS_SNAPSHOTS_TOTAL,
];
pub(crate) const GAUGES: [Metric; 2] = [BROKERS_REGISTERED, ACTIVE_CONNECTIONS];

// PLACEMENT Metrics --------------------------

pub(crate) const QUEUE_CREATES_TOTAL: Metric = Metric {
    name: "queue_scheduler_queue_creates_total",
    description: "Total number of create queue calls issued to brokers",
};

pub(crate) const QUEUE_DELETES_TOTAL: Metric = Metric {
    name: "queue_scheduler_queue_deletes_total",
    description: "Total number of delete queue calls issued to brokers",
};

pub(crate) const PLACEMENT_FAILURES_TOTAL: Metric = Metric {
    name: "queue_scheduler_placement_failures_total",
    description: "Total number of scheduling events abandoned because of a broker failure",
};

pub(crate) const BROKERS_REGISTERED: Metric = Metric {
    name: "queue_scheduler_brokers_registered",
    description: "Number of brokers currently registered across all groups",
};

// CONNECTION Metrics --------------------------

pub(crate) const CONNECTIONS_TOTAL: Metric = Metric {
    name: "queue_scheduler_connections_total",
    description: "Total number of broker connections accepted",
};

pub(crate) const ACTIVE_CONNECTIONS: Metric = Metric {
    name: "queue_scheduler_active_connections",
    description: "Number of open broker connections",
};

// CONFIGURATION Metrics --------------------------

pub(crate) const ADDRESS_SNAPSHOTS_TOTAL: Metric = Metric {
    name: "queue_scheduler_address_snapshots_total",
    description: "Total number of address snapshots pushed to the scheduler",
};

pub fn init_metrics(prom_addr: Option<SocketAddr>) -> anyhow::Result<()> {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(address = %addr, "prometheus exporter listening");
    }

    for metric in COUNTERS {
        register_counter(metric)
    }

    for metric in GAUGES {
        register_gauge(metric)
    }

    Ok(())
}

/// Registers a counter with the given name.
fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

/// Registers a gauge with the given name.
fn register_gauge(metric: Metric) {
    metrics::describe_gauge!(metric.name, metric.description);
    let _gauge = metrics::gauge!(metric.name);
}
