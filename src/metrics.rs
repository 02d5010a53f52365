//! Prometheus metrics of the orchestration operations

use crate::error::{Result, StatusCode};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Operation counters and latencies
#[derive(Clone)]
pub struct CsiMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
}

impl CsiMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "joviandss_csi_operations_total",
                "Orchestration operations by outcome",
            ),
            &["operation", "code"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "joviandss_csi_operation_duration_seconds",
                "Duration of orchestration operations",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["operation"],
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            operations,
            duration,
        })
    }

    /// Record one finished operation; `code` is `None` on success
    pub fn observe(&self, operation: &str, code: Option<StatusCode>, elapsed: Duration) {
        let code = code.map(|c| c.as_str()).unwrap_or("OK");
        self.operations.with_label_values(&[operation, code]).inc();
        self.duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn count(&self, operation: &str, code: &str) -> u64 {
        self.operations.with_label_values(&[operation, code]).get()
    }

    /// Text exposition of every metric
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
