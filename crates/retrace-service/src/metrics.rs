//! Statsd metrics of the retrace pipeline.
//!
//! Metrics are only sent once [`configure_from_config`] installed a client. Until then, and in
//! runs without a `statsd` host, the [`metric!`](crate::metric) macro is a no-op.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{
    BufferedUdpMetricSink, Metric, MetricBuilder, MetricSink, QueuingMetricSink, StatsdClient,
};

use crate::config::Metrics;

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Upper bound of metrics queued for the background sender before new ones are dropped.
const QUEUE_CAPACITY: usize = 10_000;

pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client tagging every metric with the configured custom tags.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn new(
        prefix: &str,
        sink: impl MetricSink + Send + Sync + std::panic::RefUnwindSafe + 'static,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            statsd: StatsdClient::from_sink(prefix, sink),
            tags,
        }
    }

    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Installs a statsd client sending to the host in `config`.
///
/// Does nothing without a `statsd` host. Workers send through a queue, so a slow or missing
/// statsd server never blocks retracing.
pub fn configure_from_config(config: &Metrics) -> io::Result<()> {
    let Some(ref host) = config.statsd else {
        return Ok(());
    };

    let addr = host
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::other(format!("cannot resolve statsd host '{host}'")))?;
    tracing::info!("Reporting metrics to statsd at {}", addr);

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = QueuingMetricSink::with_capacity(
        BufferedUdpMetricSink::from(addr, socket).map_err(io::Error::other)?,
        QUEUE_CAPACITY,
    );

    let client = MetricsClient::new(&config.prefix, sink, config.custom_tags.clone());
    if CLIENT.set(client).is_err() {
        tracing::warn!("statsd was already configured");
    }
    Ok(())
}

/// Invokes `f` with the installed client, if any.
#[inline(always)]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&MetricsClient),
{
    if let Some(client) = CLIENT.get() {
        f(client)
    }
}

/// Emits a counter, gauge or timer.
///
/// ```ignore
/// metric!(counter("retrace.tasks") += 1, "status" => "done");
/// metric!(gauge("retrace.pending") = ssources.len() as u64);
/// metric!(timer("unpack.duration") = start.elapsed());
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}
