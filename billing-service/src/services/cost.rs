//! Usage-cost lookup for the estimate, with a per-period cache.

use crate::models::{BillingPeriod, UsageBreakdown};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CostReportError {
    #[error("cost reporting not configured")]
    NotConfigured,

    #[error("cost reporting unavailable: {0}")]
    Unavailable(String),

    #[error("invalid cost report: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait CostReporter: Send + Sync {
    async fn usage_cost(&self, tenant_id: &str, period: &BillingPeriod) -> Result<UsageBreakdown, CostReportError>;
}

/// Reads `{"breakdown": {"<service>": <cost>, ...}}` from an HTTP endpoint.
pub struct HttpCostReporter {
    client: Client,
    url: String,
}

impl HttpCostReporter {
    pub fn new(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

fn parse_breakdown(body: &Value) -> Result<UsageBreakdown, CostReportError> {
    let Some(entries) = body.get("breakdown").and_then(Value::as_object) else {
        return Err(CostReportError::Invalid("missing breakdown".to_string()));
    };
    let mut breakdown = UsageBreakdown::new();
    for (service, cost) in entries {
        let cost = match cost {
            Value::Number(n) => Decimal::from_str(&n.to_string()),
            Value::String(s) => Decimal::from_str(s),
            other => return Err(CostReportError::Invalid(format!("{} = {}", service, other))),
        }
        .map_err(|e| CostReportError::Invalid(format!("{}: {}", service, e)))?;
        breakdown.insert(service.clone(), cost);
    }
    Ok(breakdown)
}

#[async_trait]
impl CostReporter for HttpCostReporter {
    async fn usage_cost(&self, tenant_id: &str, period: &BillingPeriod) -> Result<UsageBreakdown, CostReportError> {
        let period_start = period.start.date_naive().to_string();
        let period_end = period.last_day().to_string();
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("tenantId", tenant_id),
                ("periodStart", period_start.as_str()),
                ("periodEnd", period_end.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CostReportError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CostReportError::Unavailable(format!("HTTP {}", status.as_u16())));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| CostReportError::Invalid(e.to_string()))?;
        parse_breakdown(&body)
    }
}

/// Fixed answers per tenant.
#[derive(Default)]
pub struct StaticCostReporter {
    breakdowns: HashMap<String, UsageBreakdown>,
    calls: AtomicU64,
}

impl StaticCostReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant_id: &str, breakdown: UsageBreakdown) -> Self {
        self.breakdowns.insert(tenant_id.to_string(), breakdown);
        self
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CostReporter for StaticCostReporter {
    async fn usage_cost(&self, tenant_id: &str, _period: &BillingPeriod) -> Result<UsageBreakdown, CostReportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.breakdowns.get(tenant_id).cloned().unwrap_or_default())
    }
}

/// Always fails; used when no cost endpoint is configured.
pub struct FailingCostReporter {
    error: CostReportError,
}

impl FailingCostReporter {
    pub fn new(error: CostReportError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl CostReporter for FailingCostReporter {
    async fn usage_cost(&self, _tenant_id: &str, _period: &BillingPeriod) -> Result<UsageBreakdown, CostReportError> {
        Err(self.error.clone())
    }
}

/// Caches successful lookups per `(tenant, YYYY-MM)`. Failures are never cached.
pub struct CachedCostReporter {
    inner: Arc<dyn CostReporter>,
    ttl: Duration,
    entries: DashMap<(String, String), (Instant, UsageBreakdown)>,
}

impl CachedCostReporter {
    pub fn new(inner: Arc<dyn CostReporter>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn invalidate(&self, tenant_id: &str, period: &BillingPeriod) {
        self.entries.remove(&(tenant_id.to_string(), period.key()));
    }
}

#[async_trait]
impl CostReporter for CachedCostReporter {
    async fn usage_cost(&self, tenant_id: &str, period: &BillingPeriod) -> Result<UsageBreakdown, CostReportError> {
        let key = (tenant_id.to_string(), period.key());
        if let Some(entry) = self.entries.get(&key) {
            let (stored_at, breakdown) = entry.value();
            if stored_at.elapsed() < self.ttl {
                return Ok(breakdown.clone());
            }
        }

        let breakdown = self.inner.usage_cost(tenant_id, period).await?;
        self.entries.insert(key, (Instant::now(), breakdown.clone()));
        Ok(breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn usage() -> UsageBreakdown {
        UsageBreakdown::from([
            ("s3".to_string(), Decimal::new(210, 2)),
            ("lambda".to_string(), Decimal::new(24, 2)),
        ])
    }

    #[tokio::test]
    async fn test_http_reporter_parses_breakdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/costs"))
            .and(query_param("tenantId", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "breakdown": {"s3": 2.10, "lambda": "0.24"}
            })))
            .mount(&server)
            .await;

        let reporter = HttpCostReporter::new(Client::new(), &format!("{}/costs", server.uri()));
        let breakdown = reporter
            .usage_cost("t1", &BillingPeriod::containing(Utc::now()))
            .await
            .unwrap();
        assert_eq!(breakdown, usage());
    }

    #[tokio::test]
    async fn test_http_reporter_outage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let reporter = HttpCostReporter::new(Client::new(), &server.uri());
        let err = reporter
            .usage_cost("t1", &BillingPeriod::containing(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, CostReportError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_cache_hits_and_invalidation() {
        let inner = Arc::new(StaticCostReporter::new().with_tenant("t1", usage()));
        let cached = CachedCostReporter::new(inner.clone(), Duration::from_secs(3600));
        let period = BillingPeriod::containing(Utc::now());

        cached.usage_cost("t1", &period).await.unwrap();
        cached.usage_cost("t1", &period).await.unwrap();
        assert_eq!(inner.call_count(), 1);

        cached.invalidate("t1", &period);
        cached.usage_cost("t1", &period).await.unwrap();
        assert_eq!(inner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cached = CachedCostReporter::new(
            Arc::new(FailingCostReporter::new(CostReportError::Unavailable("down".into()))),
            Duration::from_secs(3600),
        );
        let period = BillingPeriod::containing(Utc::now());
        assert!(cached.usage_cost("t1", &period).await.is_err());
        assert!(cached.entries.is_empty());
    }
}
