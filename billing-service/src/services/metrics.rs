//! Prometheus metrics for billing operations.
//!
//! HTTP request metrics come from the `metrics` recorder installed here; domain counters
//! live in a dedicated `prometheus` registry. `/metrics` renders both.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{CounterVec, Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Charges created at a provider, by provider and payment purpose.
pub static CHARGES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Charged amount by currency.
pub static CHARGE_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Webhook deliveries by provider and processing outcome.
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Monthly batch tenant results.
pub static BATCH_TENANTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoice PDFs rendered and uploaded.
pub static PDF_GENERATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Provider call failures by provider and error kind.
pub static PROVIDER_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn int_counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Option<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).ok()?;
    registry.register(Box::new(counter.clone())).ok()?;
    Some(counter)
}

/// Initialize all metrics. Safe to call more than once; later calls are no-ops.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_none() {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(e) => tracing::warn!(error = %e, "Prometheus recorder not installed"),
        }
    }

    if PROMETHEUS_REGISTRY.get().is_some() {
        return;
    }
    let registry = Registry::new();

    let counters = [
        (
            &CHARGES_CREATED_TOTAL,
            "billing_charges_created_total",
            "Total charges created by provider and purpose",
            &["provider", "purpose"][..],
        ),
        (
            &WEBHOOK_EVENTS_TOTAL,
            "billing_webhook_events_total",
            "Total webhook deliveries by provider and outcome",
            &["provider", "outcome"][..],
        ),
        (
            &BATCH_TENANTS_TOTAL,
            "billing_batch_tenants_total",
            "Total tenants processed by the monthly batch by outcome",
            &["outcome"][..],
        ),
        (
            &PDF_GENERATED_TOTAL,
            "billing_pdf_generated_total",
            "Total invoice PDFs generated by invoice status",
            &["status"][..],
        ),
        (
            &PROVIDER_ERRORS_TOTAL,
            "billing_provider_errors_total",
            "Total provider call failures by provider and kind",
            &["provider", "kind"][..],
        ),
    ];
    for (slot, name, help, labels) in counters {
        if let Some(counter) = int_counter(&registry, name, help, labels) {
            let _ = slot.set(counter);
        }
    }

    if let Ok(amount) = CounterVec::new(
        Opts::new("billing_charge_amount_total", "Total charged amount by currency"),
        &["currency"],
    ) {
        if registry.register(Box::new(amount.clone())).is_ok() {
            let _ = CHARGE_AMOUNT_TOTAL.set(amount);
        }
    }

    let _ = PROMETHEUS_REGISTRY.set(registry);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    if let Some(registry) = PROMETHEUS_REGISTRY.get() {
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&registry.gather(), &mut buffer).is_ok() {
            output.push_str(&String::from_utf8_lossy(&buffer));
        }
    }

    output
}

pub fn record_charge_created(provider: &str, purpose: &str, currency: &str, amount: f64) {
    if let Some(counter) = CHARGES_CREATED_TOTAL.get() {
        counter.with_label_values(&[provider, purpose]).inc();
    }
    if let Some(counter) = CHARGE_AMOUNT_TOTAL.get() {
        counter.with_label_values(&[currency]).inc_by(amount.abs());
    }
}

pub fn record_webhook(provider: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[provider, outcome]).inc();
    }
}

pub fn record_batch_tenant(outcome: &str) {
    if let Some(counter) = BATCH_TENANTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_pdf_generated(status: &str) {
    if let Some(counter) = PDF_GENERATED_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn record_provider_error(provider: &str, kind: &str) {
    if let Some(counter) = PROVIDER_ERRORS_TOTAL.get() {
        counter.with_label_values(&[provider, kind]).inc();
    }
}
