use crate::error::AppResult;

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Process-wide counters and gauges.
///
/// One instance is built at startup and handed to every component as an
/// `Arc<AppMetrics>`; nothing depends on registration order.
#[derive(Clone, Debug)]
pub struct AppMetrics {
    registry: Registry,

    // --------------------------------------------
    // Throughput
    // --------------------------------------------
    pub received_total: IntCounter,
    pub sent_total: IntCounter,
    pub dumped_total: IntCounter,

    // --------------------------------------------
    // Upstream health
    // --------------------------------------------
    pub good_servers: IntGauge,
    pub bad_servers: IntGauge,

    // --------------------------------------------
    // Backpressure / spool
    // --------------------------------------------
    pub send_queue_depth: IntGauge,
    pub queued_dumps: IntGauge,
}

impl AppMetrics {
    /// `prefix` is prepended to every metric name when non-empty
    /// (`metrics_prefix` config option).
    pub fn new(prefix: &str) -> AppResult<Self> {
        let registry = if prefix.is_empty() {
            Registry::new()
        } else {
            Registry::new_custom(Some(prefix.to_string()), None)?
        };

        let received_total = IntCounter::with_opts(Opts::new(
            "ch_received_count",
            "Insert requests accepted by the collector",
        ))?;

        let sent_total = IntCounter::with_opts(Opts::new(
            "ch_sent_count",
            "Batches delivered to an upstream server",
        ))?;

        let dumped_total = IntCounter::with_opts(Opts::new(
            "ch_dump_count",
            "Batches spooled to disk after terminal send failure",
        ))?;

        let good_servers = IntGauge::with_opts(Opts::new(
            "ch_good_servers",
            "Configured upstream servers currently eligible",
        ))?;

        let bad_servers = IntGauge::with_opts(Opts::new(
            "ch_bad_servers",
            "Configured upstream servers currently marked bad",
        ))?;

        let send_queue_depth = IntGauge::with_opts(Opts::new(
            "ch_send_queue",
            "Batches queued or in flight in the sender",
        ))?;

        let queued_dumps = IntGauge::with_opts(Opts::new(
            "ch_queued_dumps",
            "Dump files waiting on disk for replay",
        ))?;

        registry.register(Box::new(received_total.clone()))?;
        registry.register(Box::new(sent_total.clone()))?;
        registry.register(Box::new(dumped_total.clone()))?;
        registry.register(Box::new(good_servers.clone()))?;
        registry.register(Box::new(bad_servers.clone()))?;
        registry.register(Box::new(send_queue_depth.clone()))?;
        registry.register(Box::new(queued_dumps.clone()))?;

        Ok(Self {
            registry,
            received_total,
            sent_total,
            dumped_total,
            good_servers,
            bad_servers,
            send_queue_depth,
            queued_dumps,
        })
    }

    pub fn encode_text(&self) -> AppResult<String> {
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&mf, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    #[inline]
    pub fn inc_received(&self) {
        self.received_total.inc();
    }

    #[inline]
    pub fn inc_sent(&self) {
        self.sent_total.inc();
    }

    #[inline]
    pub fn inc_dumped(&self) {
        self.dumped_total.inc();
    }

    #[inline]
    pub fn set_server_states(&self, good: i64, bad: i64) {
        self.good_servers.set(good);
        self.bad_servers.set(bad);
    }

    #[inline]
    pub fn set_send_queue_depth(&self, depth: i64) {
        self.send_queue_depth.set(depth);
    }

    #[inline]
    pub fn set_queued_dumps(&self, n: i64) {
        self.queued_dumps.set(n);
    }
}
