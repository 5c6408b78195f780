//! Prometheus metrics for training observability.
//!
//! Provides iteration timing, workload balance, scene growth and
//! redistribution metrics.

use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
#[cfg(feature = "metrics-server")]
use tracing::info;

/// Global metrics registry
static REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Collection of all splatgrid training metrics
pub struct MetricsRegistry {
    pub registry: Registry,

    // Training metrics
    pub training_loss: Histogram,
    pub iteration_duration: Histogram,
    pub iterations_completed: Counter,
    pub learning_rate: Gauge,

    // Workload-division metrics
    pub strategy_imbalance: Gauge,
    pub phase_duration: HistogramVec,

    // Scene metrics
    pub point_count: Gauge,
    pub points_added: Counter,
    pub points_pruned: Counter,
    pub points_transferred: Counter,

    // Memory-watchdog metrics
    pub peak_memory_units: Gauge,
    pub growth_disabled: Gauge,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        // Loss histogram with buckets for typical reconstruction losses
        let training_loss = Histogram::with_opts(
            HistogramOpts::new("splatgrid_training_loss", "Training loss value")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
        )
        .unwrap();
        registry.register(Box::new(training_loss.clone())).unwrap();

        // Iteration duration in seconds
        let iteration_duration = Histogram::with_opts(
            HistogramOpts::new("splatgrid_iteration_seconds", "Time per training iteration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
        )
        .unwrap();
        registry
            .register(Box::new(iteration_duration.clone()))
            .unwrap();

        let iterations_completed = Counter::with_opts(Opts::new(
            "splatgrid_iterations_completed_total",
            "Total training iterations completed",
        ))
        .unwrap();
        registry
            .register(Box::new(iterations_completed.clone()))
            .unwrap();

        let learning_rate = Gauge::with_opts(Opts::new(
            "splatgrid_learning_rate",
            "Current position learning rate",
        ))
        .unwrap();
        registry.register(Box::new(learning_rate.clone())).unwrap();

        // Ratio of slowest worker time to mean worker time for a view
        let strategy_imbalance = Gauge::with_opts(Opts::new(
            "splatgrid_strategy_imbalance",
            "Max-over-mean ratio of per-worker render times",
        ))
        .unwrap();
        registry
            .register(Box::new(strategy_imbalance.clone()))
            .unwrap();

        let phase_duration = HistogramVec::new(
            HistogramOpts::new("splatgrid_phase_seconds", "Time per iteration phase")
                .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["phase"],
        )
        .unwrap();
        registry.register(Box::new(phase_duration.clone())).unwrap();

        // Scene gauges and counters
        let point_count = Gauge::with_opts(Opts::new(
            "splatgrid_point_count",
            "Entities owned by this worker",
        ))
        .unwrap();
        registry.register(Box::new(point_count.clone())).unwrap();

        let points_added = Counter::with_opts(Opts::new(
            "splatgrid_points_added_total",
            "Entities created by densification",
        ))
        .unwrap();
        registry.register(Box::new(points_added.clone())).unwrap();

        let points_pruned = Counter::with_opts(Opts::new(
            "splatgrid_points_pruned_total",
            "Entities removed by pruning",
        ))
        .unwrap();
        registry.register(Box::new(points_pruned.clone())).unwrap();

        let points_transferred = Counter::with_opts(Opts::new(
            "splatgrid_points_transferred_total",
            "Entities moved between workers by redistribution",
        ))
        .unwrap();
        registry
            .register(Box::new(points_transferred.clone()))
            .unwrap();

        // Memory watchdog
        let peak_memory_units = Gauge::with_opts(Opts::new(
            "splatgrid_peak_memory_units",
            "Cluster-wide peak memory reading",
        ))
        .unwrap();
        registry
            .register(Box::new(peak_memory_units.clone()))
            .unwrap();

        let growth_disabled = Gauge::with_opts(Opts::new(
            "splatgrid_growth_disabled",
            "1 once the memory latch has disabled point growth",
        ))
        .unwrap();
        registry
            .register(Box::new(growth_disabled.clone()))
            .unwrap();

        Self {
            registry,
            training_loss,
            iteration_duration,
            iterations_completed,
            learning_rate,
            strategy_imbalance,
            phase_duration,
            point_count,
            points_added,
            points_pruned,
            points_transferred,
            peak_memory_units,
            growth_disabled,
        }
    }

    /// Gather all metrics as Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

/// Get the global metrics registry.
pub fn get_metrics() -> &'static MetricsRegistry {
    REGISTRY.get_or_init(MetricsRegistry::new)
}

/// Record one completed training iteration.
pub fn record_iteration(loss: f64, duration_secs: f64, lr: f64) {
    let m = get_metrics();
    m.training_loss.observe(loss);
    m.iteration_duration.observe(duration_secs);
    m.iterations_completed.inc();
    m.learning_rate.set(lr);
}

/// Record a phase duration within an iteration.
pub fn record_phase(phase: &str, duration_secs: f64) {
    get_metrics()
        .phase_duration
        .with_label_values(&[phase])
        .observe(duration_secs);
}

/// Record the load balance of a measured strategy.
pub fn record_imbalance(times: &[f64]) {
    if times.is_empty() {
        return;
    }
    let max = times.iter().cloned().fold(f64::MIN, f64::max);
    let mean = times.iter().sum::<f64>() / times.len() as f64;
    if mean > 0.0 {
        get_metrics().strategy_imbalance.set(max / mean);
    }
}

/// Record the local entity count.
pub fn record_point_count(count: usize) {
    get_metrics().point_count.set(count as f64);
}

/// Record a growth/prune pass.
pub fn record_growth(added: usize, pruned: usize) {
    let m = get_metrics();
    m.points_added.inc_by(added as f64);
    m.points_pruned.inc_by(pruned as f64);
}

/// Record a redistribution pass.
pub fn record_redistribution(transferred: usize) {
    get_metrics().points_transferred.inc_by(transferred as f64);
}

/// Record the cluster-wide peak memory reading and latch state.
pub fn record_memory(peak_units: f64, latched: bool) {
    let m = get_metrics();
    m.peak_memory_units.set(peak_units);
    m.growth_disabled.set(if latched { 1.0 } else { 0.0 });
}

/// Start a simple HTTP server to expose metrics on the given port.
///
/// This is a basic implementation. For production, consider using
/// a proper web framework with graceful shutdown.
#[cfg(feature = "metrics-server")]
pub async fn start_metrics_server(port: u16) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Metrics server started");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics = get_metrics().gather();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics.len(),
                metrics
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MetricsRegistry::new();
        metrics.training_loss.observe(0.25);
        metrics.points_transferred.inc_by(128.0);

        let output = metrics.gather();
        assert!(output.contains("splatgrid_training_loss"));
        assert!(output.contains("splatgrid_points_transferred_total"));
    }

    #[test]
    fn test_record_iteration() {
        record_iteration(0.1, 0.02, 1.6e-4);
        record_imbalance(&[1.0, 2.0, 3.0]);

        let output = get_metrics().gather();
        assert!(output.contains("splatgrid_iteration_seconds"));
        assert!(output.contains("splatgrid_strategy_imbalance"));
    }
}
