//! Domain services for billing-service.

pub mod admin;
pub mod batch;
pub mod blob;
pub mod cost;
pub mod email;
pub mod invoice_engine;
pub mod keyed_lock;
pub mod mandate;
pub mod members;
pub mod metrics;
pub mod oauth_bridge;
pub mod paypal_billing;
pub mod pdf;
pub mod reconciler;
pub mod stripe_billing;

#[cfg(test)]
pub(crate) mod test_support;

pub use admin::AdminService;
pub use batch::MonthlyBatch;
pub use blob::{BlobError, BlobStore, InMemoryBlobStore, LocalBlobStore, UrlSigner};
pub use cost::{CachedCostReporter, CostReportError, CostReporter, FailingCostReporter, HttpCostReporter, StaticCostReporter};
pub use email::{EmailError, EmailSender, MockEmailSender, SmtpEmailSender};
pub use invoice_engine::InvoiceEngine;
pub use mandate::MandateService;
pub use members::MemberService;
pub use metrics::{get_metrics, init_metrics};
pub use oauth_bridge::ConnectBridge;
pub use paypal_billing::PaypalBillingService;
pub use pdf::PdfGenerator;
pub use reconciler::Reconciler;
pub use stripe_billing::StripeBillingService;
