//! Sender metrics
//!
//! Metrics are injected into each sender instead of living in process-wide
//! statics. Every series is labelled by `(service, name)` of the sender.

use crate::error::{SenderError, SenderResult};
use crate::types::SenderMeta;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Router};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::future::Future;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metrics sink of a sender
pub trait SenderMetrics: Send + Sync {
    fn record_send(&self, sender: &SenderMeta);

    fn record_get_fee_failure(&self, sender: &SenderMeta);

    fn record_broadcast_failure(&self, sender: &SenderMeta);

    fn record_resubmit(&self, sender: &SenderMeta);

    fn record_resubmit_failure(&self, sender: &SenderMeta);

    fn record_check_pending(&self, sender: &SenderMeta);

    fn record_confirmation(&self, sender: &SenderMeta, successful: bool);

    /// Fee fields of the last transaction built, in wei
    fn record_fees(
        &self,
        sender: &SenderMeta,
        gas_price: f64,
        gas_tip_cap: f64,
        gas_fee_cap: f64,
        gas_limit: f64,
    );
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSenderMetrics;

impl SenderMetrics for NoopSenderMetrics {
    fn record_send(&self, _sender: &SenderMeta) {}
    fn record_get_fee_failure(&self, _sender: &SenderMeta) {}
    fn record_broadcast_failure(&self, _sender: &SenderMeta) {}
    fn record_resubmit(&self, _sender: &SenderMeta) {}
    fn record_resubmit_failure(&self, _sender: &SenderMeta) {}
    fn record_check_pending(&self, _sender: &SenderMeta) {}
    fn record_confirmation(&self, _sender: &SenderMeta, _successful: bool) {}
    fn record_fees(
        &self,
        _sender: &SenderMeta,
        _gas_price: f64,
        _gas_tip_cap: f64,
        _gas_fee_cap: f64,
        _gas_limit: f64,
    ) {
    }
}

/// Prometheus-backed sender metrics
pub struct PrometheusSenderMetrics {
    send_total: CounterVec,
    get_fee_failure_total: CounterVec,
    broadcast_failure_total: CounterVec,
    resubmit_total: CounterVec,
    resubmit_failure_total: CounterVec,
    check_pending_total: CounterVec,
    confirmed_total: CounterVec,
    confirmed_failed_total: CounterVec,
    gas_price: GaugeVec,
    gas_tip_cap: GaugeVec,
    gas_fee_cap: GaugeVec,
    gas_limit: GaugeVec,
}

const LABELS: &[&str] = &["service", "name"];

fn counter(registry: &Registry, name: &str, help: &str) -> SenderResult<CounterVec> {
    let counter = CounterVec::new(Opts::new(name, help), LABELS).map_err(metrics_error)?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(metrics_error)?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> SenderResult<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), LABELS).map_err(metrics_error)?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(metrics_error)?;
    Ok(gauge)
}

fn metrics_error(e: prometheus::Error) -> SenderError {
    SenderError::Internal(format!("metrics registration failed: {}", e))
}

impl PrometheusSenderMetrics {
    /// Register all sender series on `registry`
    pub fn new(registry: &Registry) -> SenderResult<Self> {
        Ok(Self {
            send_total: counter(
                registry,
                "rollup_sender_send_transaction_total",
                "Total transactions sent",
            )?,
            get_fee_failure_total: counter(
                registry,
                "rollup_sender_send_transaction_get_fee_failure_total",
                "Total failures to estimate fees",
            )?,
            broadcast_failure_total: counter(
                registry,
                "rollup_sender_send_transaction_send_tx_failure_total",
                "Total broadcast failures",
            )?,
            resubmit_total: counter(
                registry,
                "rollup_sender_resubmit_transaction_total",
                "Total escalated resubmissions",
            )?,
            resubmit_failure_total: counter(
                registry,
                "rollup_sender_resubmit_transaction_failure_total",
                "Total failed resubmissions",
            )?,
            check_pending_total: counter(
                registry,
                "rollup_sender_check_pending_transaction_total",
                "Total pending transaction checks",
            )?,
            confirmed_total: counter(
                registry,
                "rollup_sender_confirmed_successful_total",
                "Total confirmed successful transactions",
            )?,
            confirmed_failed_total: counter(
                registry,
                "rollup_sender_confirmed_failed_total",
                "Total confirmed failed transactions",
            )?,
            gas_price: gauge(
                registry,
                "rollup_sender_gas_price",
                "Gas price of the last transaction",
            )?,
            gas_tip_cap: gauge(
                registry,
                "rollup_sender_gas_tip_cap",
                "Gas tip cap of the last transaction",
            )?,
            gas_fee_cap: gauge(
                registry,
                "rollup_sender_gas_fee_cap",
                "Gas fee cap of the last transaction",
            )?,
            gas_limit: gauge(
                registry,
                "rollup_sender_gas_limit",
                "Gas limit of the last transaction",
            )?,
        })
    }

    fn labels(sender: &SenderMeta) -> [&str; 2] {
        [sender.service.as_str(), sender.name.as_str()]
    }
}

impl SenderMetrics for PrometheusSenderMetrics {
    fn record_send(&self, sender: &SenderMeta) {
        self.send_total.with_label_values(&Self::labels(sender)).inc();
    }

    fn record_get_fee_failure(&self, sender: &SenderMeta) {
        self.get_fee_failure_total
            .with_label_values(&Self::labels(sender))
            .inc();
    }

    fn record_broadcast_failure(&self, sender: &SenderMeta) {
        self.broadcast_failure_total
            .with_label_values(&Self::labels(sender))
            .inc();
    }

    fn record_resubmit(&self, sender: &SenderMeta) {
        self.resubmit_total.with_label_values(&Self::labels(sender)).inc();
    }

    fn record_resubmit_failure(&self, sender: &SenderMeta) {
        self.resubmit_failure_total
            .with_label_values(&Self::labels(sender))
            .inc();
    }

    fn record_check_pending(&self, sender: &SenderMeta) {
        self.check_pending_total
            .with_label_values(&Self::labels(sender))
            .inc();
    }

    fn record_confirmation(&self, sender: &SenderMeta, successful: bool) {
        let counter = if successful {
            &self.confirmed_total
        } else {
            &self.confirmed_failed_total
        };
        counter.with_label_values(&Self::labels(sender)).inc();
    }

    fn record_fees(
        &self,
        sender: &SenderMeta,
        gas_price: f64,
        gas_tip_cap: f64,
        gas_fee_cap: f64,
        gas_limit: f64,
    ) {
        let labels = Self::labels(sender);
        self.gas_price.with_label_values(&labels).set(gas_price);
        self.gas_tip_cap.with_label_values(&labels).set(gas_tip_cap);
        self.gas_fee_cap.with_label_values(&labels).set(gas_fee_cap);
        self.gas_limit.with_label_values(&labels).set(gas_limit);
    }
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
    registry: Registry,
}

impl MetricsServer {
    pub fn new(port: u16, registry: Registry) -> Self {
        Self { port, registry }
    }

    /// Serve `GET /metrics` until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> SenderResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.registry);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SenderError::Internal(format!("failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| SenderError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer).map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SenderType;
    use ethers::types::Address;

    fn meta() -> SenderMeta {
        SenderMeta {
            name: "commit".to_string(),
            service: "rollup_relayer".to_string(),
            address: Address::zero(),
            sender_type: SenderType::CommitBatch,
        }
    }

    #[test]
    fn test_metrics_are_labelled_by_sender() {
        let registry = Registry::new();
        let metrics = PrometheusSenderMetrics::new(&registry).unwrap();
        metrics.record_send(&meta());
        metrics.record_send(&meta());
        metrics.record_confirmation(&meta(), false);

        let value = metrics
            .send_total
            .with_label_values(&["rollup_relayer", "commit"])
            .get();
        assert_eq!(value, 2.0);
        assert_eq!(
            metrics
                .confirmed_failed_total
                .with_label_values(&["rollup_relayer", "commit"])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_registration_is_per_registry() {
        let registry = Registry::new();
        assert!(PrometheusSenderMetrics::new(&registry).is_ok());
        // same names on the same registry collide
        assert!(PrometheusSenderMetrics::new(&registry).is_err());
        assert!(PrometheusSenderMetrics::new(&Registry::new()).is_ok());
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_registry() {
        let registry = Registry::new();
        let metrics = PrometheusSenderMetrics::new(&registry).unwrap();
        metrics.record_check_pending(&meta());

        let body = metrics_handler(State(registry)).await.unwrap();
        assert!(body.contains("rollup_sender_check_pending_transaction_total"));
    }
}
