//! Prometheus telemetry for training observability.
//!
//! Mirrors the metric set the reference training loop logs per step:
//! per-reward-source mean/max/min, aggregate reward mean/std/max/min,
//! training loss and learning rate.

use prometheus::{
    Counter, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use tracing::info;

static REGISTRY: OnceLock<TelemetryRegistry> = OnceLock::new();

/// Collection of all GRPO training metrics.
pub struct TelemetryRegistry {
    pub registry: Registry,

    // Training metrics
    pub training_loss: Histogram,
    pub learning_rate: Gauge,
    pub updates_completed: Counter,

    // Per-reward-source statistics, labeled by source name
    pub reward_mean: GaugeVec,
    pub reward_max: GaugeVec,
    pub reward_min: GaugeVec,

    // Aggregate (weighted total) reward statistics per group
    pub total_reward_mean: Gauge,
    pub total_reward_std: Gauge,
    pub total_reward_max: Gauge,
    pub total_reward_min: Gauge,

    // Generation statistics
    pub response_tokens: Histogram,
}

impl TelemetryRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let training_loss = Histogram::with_opts(
            HistogramOpts::new("grpo_training_loss", "GRPO loss per optimizer update")
                .buckets(vec![-1.0, -0.1, -0.01, 0.0, 0.01, 0.1, 1.0, 10.0]),
        )
        .unwrap();
        registry.register(Box::new(training_loss.clone())).unwrap();

        let learning_rate = Gauge::with_opts(Opts::new(
            "grpo_learning_rate",
            "Current optimizer learning rate",
        ))
        .unwrap();
        registry.register(Box::new(learning_rate.clone())).unwrap();

        let updates_completed = Counter::with_opts(Opts::new(
            "grpo_updates_completed_total",
            "Completed optimizer updates",
        ))
        .unwrap();
        registry
            .register(Box::new(updates_completed.clone()))
            .unwrap();

        let reward_mean = GaugeVec::new(
            Opts::new("grpo_reward_mean", "Mean raw reward per source"),
            &["source"],
        )
        .unwrap();
        registry.register(Box::new(reward_mean.clone())).unwrap();

        let reward_max = GaugeVec::new(
            Opts::new("grpo_reward_max", "Max raw reward per source"),
            &["source"],
        )
        .unwrap();
        registry.register(Box::new(reward_max.clone())).unwrap();

        let reward_min = GaugeVec::new(
            Opts::new("grpo_reward_min", "Min raw reward per source"),
            &["source"],
        )
        .unwrap();
        registry.register(Box::new(reward_min.clone())).unwrap();

        let total_reward_mean = Gauge::with_opts(Opts::new(
            "grpo_total_reward_mean",
            "Mean weighted reward over the last group",
        ))
        .unwrap();
        registry
            .register(Box::new(total_reward_mean.clone()))
            .unwrap();

        let total_reward_std = Gauge::with_opts(Opts::new(
            "grpo_total_reward_std",
            "Std of weighted reward over the last group",
        ))
        .unwrap();
        registry
            .register(Box::new(total_reward_std.clone()))
            .unwrap();

        let total_reward_max = Gauge::with_opts(Opts::new(
            "grpo_total_reward_max",
            "Max weighted reward over the last group",
        ))
        .unwrap();
        registry
            .register(Box::new(total_reward_max.clone()))
            .unwrap();

        let total_reward_min = Gauge::with_opts(Opts::new(
            "grpo_total_reward_min",
            "Min weighted reward over the last group",
        ))
        .unwrap();
        registry
            .register(Box::new(total_reward_min.clone()))
            .unwrap();

        let response_tokens = Histogram::with_opts(
            HistogramOpts::new("grpo_response_tokens", "Credited response tokens per sample")
                .buckets(vec![8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0]),
        )
        .unwrap();
        registry
            .register(Box::new(response_tokens.clone()))
            .unwrap();

        Self {
            registry,
            training_loss,
            learning_rate,
            updates_completed,
            reward_mean,
            reward_max,
            reward_min,
            total_reward_mean,
            total_reward_std,
            total_reward_max,
            total_reward_min,
            response_tokens,
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

impl Default for TelemetryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global telemetry registry.
pub fn telemetry() -> &'static TelemetryRegistry {
    REGISTRY.get_or_init(TelemetryRegistry::new)
}

/// Summary statistics over a slice; NaN inputs propagate into every field
/// so a misbehaving reward source stays visible.
pub fn summary_stats(values: &[f64]) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN, f64::NAN, f64::NAN);
    }
    if values.iter().any(|v| v.is_nan()) {
        return (f64::NAN, f64::NAN, f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = if values.len() > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    (mean, var.sqrt(), max, min)
}

/// Record per-source and aggregate reward statistics for one group.
pub fn record_group_rewards(names: &[&str], per_source: &[Vec<f64>], totals: &[f64]) {
    let m = telemetry();
    for (&name, scores) in names.iter().zip(per_source.iter()) {
        let (mean, _std, max, min) = summary_stats(scores);
        m.reward_mean.with_label_values(&[name]).set(mean);
        m.reward_max.with_label_values(&[name]).set(max);
        m.reward_min.with_label_values(&[name]).set(min);
    }
    let (mean, std, max, min) = summary_stats(totals);
    m.total_reward_mean.set(mean);
    m.total_reward_std.set(std);
    m.total_reward_max.set(max);
    m.total_reward_min.set(min);
}

/// Record one completed optimizer update.
pub fn record_update(loss: f64, lr: f64) {
    let m = telemetry();
    m.training_loss.observe(loss);
    m.learning_rate.set(lr);
    m.updates_completed.inc();
}

/// Record credited response lengths for one group.
pub fn record_response_lengths(lengths: &[usize]) {
    let m = telemetry();
    for &l in lengths {
        m.response_tokens.observe(l as f64);
    }
}

/// Start a simple HTTP server to expose metrics on the given port.
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

            let metrics = telemetry().gather();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics.len(),
                metrics
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

/// Log telemetry run metadata once at startup.
pub fn log_run_metadata(project: &str, run_name: Option<&str>) {
    info!(
        project = project,
        run = run_name.unwrap_or("auto"),
        "Telemetry enabled"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_stats() {
        let (mean, std, max, min) = summary_stats(&[1.0, 2.0, 3.0, 4.0]);
        assert!((mean - 2.5).abs() < 1e-12);
        assert!((std - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((max - 4.0).abs() < 1e-12);
        assert!((min - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_summary_stats_nan_propagates() {
        let (mean, std, max, min) = summary_stats(&[1.0, f64::NAN]);
        assert!(mean.is_nan() && std.is_nan() && max.is_nan() && min.is_nan());
    }

    #[test]
    fn test_record_and_gather() {
        record_group_rewards(
            &["correctness", "digit"],
            &[vec![2.0, 0.0], vec![0.5, 0.5]],
            &[2.5, 0.5],
        );
        record_update(0.25, 1e-6);
        record_response_lengths(&[3, 17]);

        let output = telemetry().gather();
        assert!(output.contains("grpo_training_loss"));
        assert!(output.contains("grpo_reward_mean"));
        assert!(output.contains("grpo_total_reward_mean"));
        assert!(output.contains("grpo_updates_completed_total"));
    }
}
