use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::{Duration, Instant};

/// Install the Prometheus recorder.
/// Returns a handle that renders metrics for scraping.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        // Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
        .set_buckets_for_metric(
            Matcher::Full("http_request_duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .context("failed to set buckets for http_request_duration_seconds")?
        .set_buckets_for_metric(
            Matcher::Full("bookings.webhook.processing_ms".to_string()),
            &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0],
        )
        .context("failed to set buckets for bookings.webhook.processing_ms")?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Background task to update process metrics every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status")
                && let Some(line) = status.lines().find(|l| l.starts_with("VmRSS:"))
                && let Some(kb) = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|kb| kb.parse::<f64>().ok())
            {
                metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Initialize booking metrics to zero so they always appear in Prometheus
/// queries even if no events have occurred
pub fn initialize_booking_metrics() {
    // Checkout
    metrics::counter!("bookings.checkout.created").absolute(0);
    metrics::counter!("stripe.api.errors").absolute(0);

    // Webhooks
    metrics::counter!("bookings.webhook.received").absolute(0);
    metrics::counter!("bookings.webhook.signature_invalid").absolute(0);
    metrics::counter!("bookings.webhook.failed").absolute(0);
    metrics::counter!("bookings.payments.failed").absolute(0);

    // Reconciliation
    metrics::counter!("bookings.confirmed").absolute(0);
    metrics::counter!("bookings.capacity_exceeded").absolute(0);
}
