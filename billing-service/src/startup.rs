//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::providers::{
    stripe::StripeWebhookVerifier, ConfigCredentialSource, CredentialCache, CredentialSource, MollieApi,
    MollieClient, MollieOAuthClient, PaymentProvider, PaypalClient, StripeClient,
};
use crate::models::ProviderKind;
use crate::routes::{self, COMMANDS};
use crate::services::{
    init_metrics, AdminService, BlobStore, CachedCostReporter, ConnectBridge, CostReportError, CostReporter, EmailSender,
    FailingCostReporter, HttpCostReporter, InvoiceEngine, LocalBlobStore, MandateService, MemberService,
    MockEmailSender, MonthlyBatch, PaypalBillingService, PdfGenerator, Reconciler, SmtpEmailSender,
    StripeBillingService, UrlSigner,
};
use crate::store::{BillingStore, MongoBillingStore};
use axum::middleware::from_fn;
use axum::Router;
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use service_core::retry::RetryConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(20);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BillingConfig,
    pub store: Arc<dyn BillingStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub signer: UrlSigner,
    pub costs: Arc<CachedCostReporter>,
    pub engine: InvoiceEngine,
    pub mandates: MandateService,
    pub connect: ConnectBridge,
    pub members: MemberService,
    pub reconciler: Reconciler,
    pub stripe: StripeBillingService,
    pub paypal: PaypalBillingService,
    pub batch: MonthlyBatch,
    pub admin: AdminService,
    pub pdfs: PdfGenerator,
}

/// External collaborators. Production wires Mongo, the filesystem and SMTP; tests swap in fakes.
pub struct Backends {
    pub store: Arc<dyn BillingStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub signer: UrlSigner,
    pub email: Arc<dyn EmailSender>,
    pub costs: Arc<dyn CostReporter>,
    pub credentials: Arc<dyn CredentialSource>,
}

/// Download links are only as trustworthy as this secret. Without one configured, links
/// are signed with a per-process secret and stop working after a restart.
pub fn url_signer(config: &BillingConfig) -> UrlSigner {
    let secret = if config.storage.signing_secret.expose_secret().is_empty() {
        tracing::warn!("BLOB_SIGNING_SECRET not set - download links will not survive a restart");
        Secret::new(uuid::Uuid::new_v4().to_string())
    } else {
        config.storage.signing_secret.clone()
    };
    UrlSigner::new(&config.storage.public_base_url, secret)
}

impl AppState {
    pub fn new(config: BillingConfig, backends: Backends) -> Result<Self, AppError> {
        let settings = config.billing.clone();
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("HTTP client: {}", e)))?;
        let retry = RetryConfig::with_max_retries(settings.provider_max_retries);
        let credentials = Arc::new(CredentialCache::new(backends.credentials));
        let store = backends.store;

        let mollie = MollieClient::new(
            http.clone(),
            &config.mollie.api_base_url,
            retry.clone(),
            credentials.clone(),
        );
        let stripe = StripeClient::new(
            http.clone(),
            &config.stripe.api_base_url,
            retry.clone(),
            credentials.clone(),
        );
        let paypal = PaypalClient::new(
            http.clone(),
            &config.paypal.api_base_url,
            retry.clone(),
            credentials.clone(),
        )
        .with_cancel_url(&config.paypal.cancel_url);

        let costs = Arc::new(CachedCostReporter::new(
            backends.costs,
            Duration::from_secs(settings.estimate_cache_ttl_secs),
        ));
        let charger: Arc<dyn PaymentProvider> = Arc::new(mollie.clone());
        let engine = InvoiceEngine::new(store.clone(), costs.clone(), charger.clone(), settings.clone());

        let connect = ConnectBridge::new(
            store.clone(),
            MollieOAuthClient::new(
                http.clone(),
                &config.mollie_connect.authorize_url,
                &config.mollie_connect.token_url,
                &config.mollie_connect.redirect_uri,
                credentials.clone(),
            ),
            MollieApi::new(
                http,
                &config.mollie_connect.api_base_url,
                retry,
                ProviderKind::MollieConnect,
            ),
            &config.mollie_connect,
            settings.clone(),
        );
        if !config.mollie_connect.is_configured() {
            tracing::warn!("Mollie Connect not configured - creator onboarding is disabled");
        }
        let members = MemberService::new(store.clone(), connect.clone(), settings.clone());

        let reconciler = Reconciler::new(
            store.clone(),
            charger,
            Arc::new(stripe.clone()),
            StripeWebhookVerifier::new(
                config.stripe.webhook_secret.clone(),
                config.stripe.webhook_tolerance_secs,
            ),
            members.clone(),
            backends.email,
            settings.clone(),
        );

        Ok(Self {
            mandates: MandateService::new(store.clone(), mollie, settings),
            stripe: StripeBillingService::new(store.clone(), stripe, engine.clone())
                .with_price_id(config.stripe.price_id.clone()),
            paypal: PaypalBillingService::new(
                store.clone(),
                paypal,
                engine.clone(),
                reconciler.clone(),
                &config.paypal.return_url,
            ),
            batch: MonthlyBatch::new(store.clone(), engine.clone()),
            admin: AdminService::new(store.clone(), engine.settings().clone()),
            pdfs: PdfGenerator::new(
                engine.clone(),
                store.clone(),
                backends.blobs.clone(),
                config.storage.url_expiry_secs,
            ),
            config,
            store,
            blobs: backends.blobs,
            signer: backends.signer,
            costs,
            engine,
            connect,
            members,
            reconciler,
        })
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build the application against MongoDB, the local blob directory and SMTP.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        init_metrics();

        let store = MongoBillingStore::connect(
            config.database.url.expose_secret(),
            &config.database.db_name,
        )
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))?;
        store.init_indexes().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to initialize database indexes");
            AppError::DatabaseError(e.into())
        })?;

        let signer = url_signer(&config);
        let blobs = LocalBlobStore::new(&config.storage.root_dir, signer.clone())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, root = %config.storage.root_dir, "Failed to open blob store");
                AppError::ConfigError(e.into())
            })?;

        let email: Arc<dyn EmailSender> = if config.smtp.enabled {
            Arc::new(SmtpEmailSender::new(config.smtp.clone()).map_err(|e| AppError::EmailError(e.to_string()))?)
        } else {
            tracing::warn!("SMTP disabled - billing emails are logged, not sent");
            Arc::new(MockEmailSender::new())
        };

        let costs: Arc<dyn CostReporter> = match &config.cost_reporting.url {
            Some(url) => Arc::new(HttpCostReporter::new(reqwest::Client::new(), url)),
            None => {
                tracing::warn!("COST_REPORTING_URL not set - invoices carry the base fee only");
                Arc::new(FailingCostReporter::new(CostReportError::NotConfigured))
            }
        };

        let credentials: Arc<dyn CredentialSource> = Arc::new(ConfigCredentialSource::new(config.clone()));

        Self::build_with(
            config,
            Backends {
                store: Arc::new(store),
                blobs: Arc::new(blobs),
                signer,
                email,
                costs,
                credentials,
            },
        )
        .await
    }

    /// Build with explicit backends. Port 0 binds a random port.
    pub async fn build_with(config: BillingConfig, backends: Backends) -> Result<Self, AppError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let state = AppState::new(config, backends)?;

        let router = routes::router(COMMANDS)?
            .layer(from_fn(metrics_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                }),
            )
            .with_state(state);

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();
        tracing::info!(port = port, routes = COMMANDS.len(), "Billing service listener bound");

        Ok(Self {
            port,
            listener,
            router,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(
            service = "billing-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );
        axum::serve(self.listener, self.router).await
    }
}
