//! Static command table for the HTTP surface.
//!
//! Every route is declared once here. The table is validated before the router is built,
//! so a malformed or duplicated entry stops startup instead of panicking inside axum.

use crate::error::BillingError;
use crate::handlers;
use crate::startup::AppState;
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
}

impl Verb {
    fn filter(self) -> MethodFilter {
        match self {
            Verb::Get => MethodFilter::GET,
            Verb::Post => MethodFilter::POST,
            Verb::Put => MethodFilter::PUT,
            Verb::Delete => MethodFilter::DELETE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
        }
    }
}

pub struct Command {
    pub verb: Verb,
    pub path: &'static str,
    handler: fn(MethodFilter) -> MethodRouter<AppState>,
}

macro_rules! command {
    ($verb:ident, $path:literal, $handler:path) => {
        Command {
            verb: Verb::$verb,
            path: $path,
            handler: |filter| on(filter, $handler),
        }
    };
}

pub static COMMANDS: &[Command] = &[
    command!(Get, "/health", handlers::health_check),
    command!(Get, "/ready", handlers::readiness_check),
    command!(Get, "/metrics", handlers::metrics),
    // Invoices and estimate
    command!(Get, "/billing/invoices/:tenant_id", handlers::invoices::list_invoices),
    command!(Get, "/billing/invoices/:tenant_id/:invoice_id/pdf", handlers::invoices::invoice_pdf),
    command!(Get, "/billing/estimate/:tenant_id", handlers::invoices::estimate),
    command!(Post, "/billing/estimate/:tenant_id/refresh", handlers::invoices::refresh_estimate),
    command!(Post, "/billing/charge/:tenant_id", handlers::invoices::create_invoice),
    command!(Get, "/billing/payment-methods/:tenant_id", handlers::payment_methods::available),
    command!(Get, "/billing/payment-method/:tenant_id", handlers::stripe::payment_method),
    command!(Post, "/billing/setup-intent/:tenant_id", handlers::stripe::setup_intent),
    // Operators
    command!(Get, "/billing/admin/tenants", handlers::admin::tenants_overview),
    command!(Put, "/billing/admin/tenants/:tenant_id/status", handlers::admin::set_tenant_status),
    command!(Get, "/billing/admin/invoices", handlers::admin::invoices),
    command!(Post, "/billing/generate-invoices", handlers::admin::generate_invoices),
    // Mollie mandate flows
    command!(Post, "/billing/mollie/webhook", handlers::mollie::webhook),
    command!(Post, "/billing/mollie/create-customer/:tenant_id", handlers::mollie::create_customer),
    command!(Get, "/billing/mollie/customer/:tenant_id", handlers::mollie::customer_status),
    command!(Post, "/billing/mollie/create-first-payment/:tenant_id", handlers::mollie::create_first_payment),
    command!(Post, "/billing/mollie/charge/:tenant_id", handlers::mollie::charge),
    command!(Delete, "/billing/mollie/mandate/:tenant_id", handlers::mollie::revoke_mandate),
    command!(Get, "/billing/mollie/payments/:tenant_id", handlers::mollie::payment_history),
    command!(Post, "/billing/mollie/process-monthly", handlers::mollie::process_monthly),
    // Mollie Connect
    command!(Post, "/billing/mollie/connect/authorize/:tenant_id", handlers::connect::authorize),
    command!(Get, "/billing/mollie/connect/callback", handlers::connect::callback),
    command!(Get, "/billing/mollie/connect/status/:tenant_id", handlers::connect::status),
    command!(Delete, "/billing/mollie/connect/:tenant_id", handlers::connect::disconnect),
    command!(Post, "/billing/mollie/connect/webhook", handlers::connect::webhook),
    command!(
        Post,
        "/billing/mollie/connect/create-member-customer/:tenant_id",
        handlers::connect::create_member_customer
    ),
    command!(
        Post,
        "/billing/mollie/connect/create-member-mandate/:tenant_id",
        handlers::connect::create_member_mandate
    ),
    command!(
        Post,
        "/billing/mollie/connect/create-member-subscription/:tenant_id",
        handlers::connect::create_member_subscription
    ),
    command!(
        Get,
        "/billing/mollie/connect/member-subscriptions/:tenant_id",
        handlers::connect::member_subscriptions
    ),
    command!(
        Delete,
        "/billing/mollie/connect/member-subscription/:tenant_id/:subscription_id",
        handlers::connect::cancel_member_subscription
    ),
    // Stripe
    command!(Post, "/billing/stripe/setup-intent/:tenant_id", handlers::stripe::setup_intent),
    command!(Get, "/billing/stripe/payment-method/:tenant_id", handlers::stripe::payment_method),
    command!(Post, "/billing/stripe/payment-intent/:tenant_id", handlers::stripe::payment_intent),
    command!(Get, "/billing/stripe/subscription/:tenant_id", handlers::stripe::subscription),
    command!(Post, "/billing/stripe/create-subscription/:tenant_id", handlers::stripe::create_subscription),
    command!(Post, "/billing/stripe/cancel-subscription/:tenant_id", handlers::stripe::cancel_subscription),
    command!(Post, "/billing/stripe/payment-method/:tenant_id", handlers::stripe::add_payment_method),
    command!(Delete, "/billing/stripe/payment-method/:tenant_id", handlers::stripe::delete_payment_method),
    command!(Post, "/billing/stripe/add-usage/:tenant_id", handlers::stripe::add_usage),
    command!(Get, "/billing/stripe/invoices/:tenant_id", handlers::stripe::invoices),
    command!(Post, "/billing/stripe/webhook", handlers::stripe::webhook),
    // PayPal
    command!(Post, "/billing/paypal/create-order/:tenant_id", handlers::paypal::create_order),
    command!(Post, "/billing/paypal/capture/:tenant_id", handlers::paypal::capture),
    // Signed artifact downloads
    command!(Get, "/billing/blobs/*key", handlers::blobs::download),
];

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_path(path: &str) -> Result<(), String> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(format!("path '{}' must start with '/'", path));
    };
    let segments: Vec<&str> = rest.split('/').collect();
    let mut params = HashSet::new();
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(format!("path '{}' has an empty segment", path));
        }
        let name = if let Some(name) = segment.strip_prefix(':') {
            name
        } else if let Some(name) = segment.strip_prefix('*') {
            if index + 1 != segments.len() {
                return Err(format!("wildcard in '{}' must be the last segment", path));
            }
            name
        } else {
            if segment.contains([':', '*', '{', '}']) {
                return Err(format!("malformed segment '{}' in '{}'", segment, path));
            }
            continue;
        };
        if !is_identifier(name) {
            return Err(format!("malformed parameter '{}' in '{}'", segment, path));
        }
        if !params.insert(name) {
            return Err(format!("parameter '{}' repeated in '{}'", name, path));
        }
    }
    Ok(())
}

/// Reject duplicate `(verb, path)` pairs and malformed paths.
pub fn validate(commands: &[Command]) -> Result<(), BillingError> {
    let mut seen = HashSet::new();
    for command in commands {
        validate_path(command.path).map_err(BillingError::Configuration)?;
        if !seen.insert((command.verb, command.path)) {
            return Err(BillingError::Configuration(format!(
                "duplicate route {} {}",
                command.verb.as_str(),
                command.path
            )));
        }
    }
    Ok(())
}

/// Validate the table and build the router. Verbs sharing a path are merged into one route.
pub fn router(commands: &[Command]) -> Result<Router<AppState>, BillingError> {
    validate(commands)?;

    let mut by_path: BTreeMap<&str, MethodRouter<AppState>> = BTreeMap::new();
    for command in commands {
        let method_router = (command.handler)(command.verb.filter());
        let merged = match by_path.remove(command.path) {
            Some(existing) => existing.merge(method_router),
            None => method_router,
        };
        by_path.insert(command.path, merged);
    }

    Ok(by_path
        .into_iter()
        .fold(Router::new(), |router, (path, method_router)| router.route(path, method_router)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(filter: MethodFilter) -> MethodRouter<AppState> {
        on(filter, || async {})
    }

    fn entry(verb: Verb, path: &'static str) -> Command {
        Command {
            verb,
            path,
            handler: noop,
        }
    }

    #[test]
    fn test_command_table_is_valid() {
        assert!(validate(COMMANDS).is_ok());
        assert!(router(COMMANDS).is_ok());
    }

    #[test]
    fn test_duplicate_route_is_rejected() {
        let table = [entry(Verb::Get, "/a/:id"), entry(Verb::Get, "/a/:id")];
        assert!(matches!(validate(&table), Err(BillingError::Configuration(_))));

        let table = [entry(Verb::Get, "/a/:id"), entry(Verb::Delete, "/a/:id")];
        assert!(validate(&table).is_ok());

        let table = [entry(Verb::Put, "/a/:id/status"), entry(Verb::Put, "/a/:id/status")];
        assert!(validate(&table).is_err());
    }

    #[test]
    fn test_malformed_paths_are_rejected() {
        for path in ["a/b", "/a//b", "/a/:", "/a/:1x", "/*rest/more", "/a/{id}", "/a/:id/:id"] {
            assert!(validate_path(path).is_err(), "{} should be rejected", path);
        }
        assert!(validate_path("/billing/blobs/*key").is_ok());
        assert!(validate_path("/billing/invoices/:tenant_id/:invoice_id/pdf").is_ok());
    }
}
