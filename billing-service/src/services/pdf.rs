//! Invoice PDF rendering and lazy artifact storage.

use crate::error::BillingError;
use crate::models::{format_amount, round_money, Invoice, ProviderKind, TenantProfile};
use crate::services::blob::BlobStore;
use crate::services::invoice_engine::InvoiceEngine;
use crate::services::metrics;
use crate::services::keyed_lock::KeyedLocks;
use crate::store::BillingStore;
use chrono::{DateTime, Utc};
use printpdf::lopdf::{self, Object, StringFormat};
use printpdf::{
    BuiltinFont, CustomPdfConformance, IndirectFontRef, Line, Mm, OffsetDateTime, PdfConformance,
    PdfDocument, Point,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DOCUMENT_CONFIG_KEY: &str = "config/billing-config.json";

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const LEFT: f32 = 20.0;
const RIGHT: f32 = 190.0;
const AMOUNT_COLUMN: f32 = 160.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyAddress {
    pub street: String,
    pub zip: String,
    pub city: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyContact {
    pub email: String,
    pub website: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyDetails {
    pub name: String,
    pub address: CompanyAddress,
    pub contact: CompanyContact,
    pub managing_director: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxSettings {
    pub vat_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BankingDetails {
    pub bank_name: String,
    pub iban: String,
    pub bic: String,
    pub account_holder: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceTexts {
    pub footer_text: String,
    pub thank_you_text: String,
}

/// Letterhead and fixed texts printed on every invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceDocumentConfig {
    pub company: CompanyDetails,
    pub tax: TaxSettings,
    pub banking: BankingDetails,
    pub invoice: InvoiceTexts,
}

impl Default for CompanyAddress {
    fn default() -> Self {
        Self {
            street: "Bahnhofstrasse 59".to_string(),
            zip: "6312".to_string(),
            city: "Steinhausen".to_string(),
            country: "Schweiz".to_string(),
        }
    }
}

impl Default for CompanyContact {
    fn default() -> Self {
        Self {
            email: "billing@viraltenant.com".to_string(),
            website: "https://viraltenant.com".to_string(),
            phone: "+41 76 361 28 39".to_string(),
        }
    }
}

impl Default for CompanyDetails {
    fn default() -> Self {
        Self {
            name: "Viral Tenant GmbH".to_string(),
            address: CompanyAddress::default(),
            contact: CompanyContact::default(),
            managing_director: "Niels Fink".to_string(),
        }
    }
}

impl Default for TaxSettings {
    fn default() -> Self {
        Self {
            vat_rate: Decimal::new(77, 1),
        }
    }
}

impl Default for BankingDetails {
    fn default() -> Self {
        Self {
            bank_name: "Zuger Kantonalbank".to_string(),
            iban: "CH2000787786265727503".to_string(),
            bic: "KBZGCH22XXX".to_string(),
            account_holder: "Niels Fink".to_string(),
        }
    }
}

impl Default for InvoiceTexts {
    fn default() -> Self {
        Self {
            footer_text: "Zahlbar innerhalb von 14 Tagen ohne Abzug.".to_string(),
            thank_you_text: "Vielen Dank für Ihr Vertrauen!".to_string(),
        }
    }
}

impl Default for InvoiceDocumentConfig {
    fn default() -> Self {
        Self {
            company: CompanyDetails::default(),
            tax: TaxSettings::default(),
            banking: BankingDetails::default(),
            invoice: InvoiceTexts::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontWeight {
    Regular,
    Bold,
}

/// One drawing instruction. Coordinates are millimetres from the top-left corner.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Text {
        x: f32,
        y: f32,
        size: f32,
        weight: FontWeight,
        text: String,
    },
    Rule {
        y: f32,
        from_x: f32,
        to_x: f32,
    },
}

impl DrawOp {
    fn text(x: f32, y: f32, size: f32, weight: FontWeight, text: impl Into<String>) -> Self {
        DrawOp::Text {
            x,
            y,
            size,
            weight,
            text: text.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DrawOp::Text { text, .. } => Some(text),
            DrawOp::Rule { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub label: String,
    pub amount: Decimal,
}

/// Base fee first, then every usage entry above zero in key order.
pub fn line_items(invoice: &Invoice) -> Vec<LineItem> {
    let mut items = vec![LineItem {
        label: "Base fee".to_string(),
        amount: invoice.base_fee,
    }];
    items.extend(
        invoice
            .usage_breakdown
            .iter()
            .filter(|(_, cost)| **cost > Decimal::ZERO)
            .map(|(service, cost)| LineItem {
                label: format!("Usage: {}", service),
                amount: *cost,
            }),
    );
    items
}

/// `(net, vat)` for a gross total; the two always add up to the total.
pub fn vat_split(total: Decimal, vat_rate: Decimal) -> (Decimal, Decimal) {
    let divisor = Decimal::ONE + vat_rate / Decimal::ONE_HUNDRED;
    let net = if divisor.is_zero() {
        total
    } else {
        round_money(total / divisor)
    };
    (net, total - net)
}

fn money(amount: Decimal, currency: &str) -> String {
    format!("{} {}", format_amount(amount), currency)
}

fn method_label(invoice: &Invoice) -> String {
    let details = invoice.payment_details.as_ref();
    let provider = details
        .map(|d| d.provider)
        .or(invoice.payment_method);
    let method = details.and_then(|d| d.method.clone());
    match (provider, method) {
        (Some(ProviderKind::Paypal), _) => "PayPal".to_string(),
        (Some(ProviderKind::Stripe), Some(m)) => format!("Stripe ({})", m),
        (Some(ProviderKind::Stripe), None) => "Stripe".to_string(),
        (Some(_), Some(m)) if m == "directdebit" => "SEPA direct debit".to_string(),
        (Some(_), Some(m)) => format!("Mollie ({})", m),
        (Some(_), None) => "Mollie".to_string(),
        (None, _) => "-".to_string(),
    }
}

fn transaction_id(invoice: &Invoice) -> Option<String> {
    let details = invoice.payment_details.as_ref();
    match details {
        Some(d) if d.provider == ProviderKind::Paypal => d
            .capture_id
            .clone()
            .or_else(|| Some(d.payment_id.clone())),
        Some(d) => Some(d.payment_id.clone()),
        None => invoice.provider_payment_id.clone(),
    }
}

/// Pure page layout for one invoice.
pub fn layout(invoice: &Invoice, tenant: &TenantProfile, config: &InvoiceDocumentConfig) -> Vec<DrawOp> {
    use FontWeight::{Bold, Regular};

    let company = &config.company;
    let mut ops = vec![
        DrawOp::text(LEFT, 22.0, 18.0, Bold, company.name.clone()),
        DrawOp::text(
            LEFT,
            29.0,
            9.0,
            Regular,
            format!(
                "{}, {} {}, {}",
                company.address.street, company.address.zip, company.address.city, company.address.country
            ),
        ),
        DrawOp::text(
            LEFT,
            34.0,
            9.0,
            Regular,
            format!("{} | {}", company.contact.email, company.contact.website),
        ),
        DrawOp::Rule {
            y: 38.0,
            from_x: LEFT,
            to_x: RIGHT,
        },
    ];

    let mut y = 50.0;
    ops.push(DrawOp::text(LEFT, y, 10.0, Bold, tenant.display_name()));
    for line in tenant.address_lines() {
        y += 5.0;
        ops.push(DrawOp::text(LEFT, y, 10.0, Regular, line));
    }

    ops.push(DrawOp::text(120.0, 50.0, 16.0, Bold, "Invoice"));
    ops.push(DrawOp::text(
        120.0,
        57.0,
        10.0,
        Regular,
        format!("Number: {}", invoice.invoice_number),
    ));
    ops.push(DrawOp::text(
        120.0,
        62.0,
        10.0,
        Regular,
        format!("Date: {}", invoice.created_at.format("%d.%m.%Y")),
    ));
    ops.push(DrawOp::text(
        120.0,
        67.0,
        10.0,
        Regular,
        format!(
            "Period: {} - {}",
            invoice.period.start.format("%d.%m.%Y"),
            invoice.period.last_day().format("%d.%m.%Y")
        ),
    ));

    y = 90.0;
    ops.push(DrawOp::text(LEFT, y, 10.0, Bold, "Description"));
    ops.push(DrawOp::text(AMOUNT_COLUMN, y, 10.0, Bold, "Amount"));
    ops.push(DrawOp::Rule {
        y: y + 2.0,
        from_x: LEFT,
        to_x: RIGHT,
    });
    for item in line_items(invoice) {
        y += 7.0;
        ops.push(DrawOp::text(LEFT, y, 10.0, Regular, item.label));
        ops.push(DrawOp::text(
            AMOUNT_COLUMN,
            y,
            10.0,
            Regular,
            money(item.amount, &invoice.currency),
        ));
    }

    let (net, vat) = vat_split(invoice.amount, config.tax.vat_rate);
    y += 4.0;
    ops.push(DrawOp::Rule {
        y,
        from_x: 110.0,
        to_x: RIGHT,
    });
    y += 6.0;
    ops.push(DrawOp::text(110.0, y, 10.0, Regular, "Net"));
    ops.push(DrawOp::text(AMOUNT_COLUMN, y, 10.0, Regular, money(net, &invoice.currency)));
    y += 6.0;
    ops.push(DrawOp::text(
        110.0,
        y,
        10.0,
        Regular,
        format!("VAT {}%", config.tax.vat_rate.normalize()),
    ));
    ops.push(DrawOp::text(AMOUNT_COLUMN, y, 10.0, Regular, money(vat, &invoice.currency)));
    y += 7.0;
    ops.push(DrawOp::text(110.0, y, 11.0, Bold, "Total"));
    ops.push(DrawOp::text(
        AMOUNT_COLUMN,
        y,
        11.0,
        Bold,
        money(invoice.amount, &invoice.currency),
    ));

    y += 20.0;
    if invoice.is_paid() {
        ops.push(DrawOp::text(LEFT, y, 12.0, Bold, "PAID"));
        y += 6.0;
        ops.push(DrawOp::text(
            LEFT,
            y,
            10.0,
            Regular,
            format!("Payment method: {}", method_label(invoice)),
        ));
        if let Some(transaction) = transaction_id(invoice) {
            y += 5.0;
            ops.push(DrawOp::text(
                LEFT,
                y,
                10.0,
                Regular,
                format!("Transaction: {}", transaction),
            ));
        }
        if let Some(paid_at) = invoice.paid_at {
            y += 5.0;
            ops.push(DrawOp::text(
                LEFT,
                y,
                10.0,
                Regular,
                format!("Paid on: {}", paid_at.format("%d.%m.%Y")),
            ));
        }
    } else {
        let bank = &config.banking;
        ops.push(DrawOp::text(LEFT, y, 11.0, Bold, "Bank details"));
        for line in [
            format!("Bank: {}", bank.bank_name),
            format!("Account holder: {}", bank.account_holder),
            format!("IBAN: {}", bank.iban),
            format!("BIC: {}", bank.bic),
            format!("Reference: {}", invoice.invoice_number),
        ] {
            y += 5.0;
            ops.push(DrawOp::text(LEFT, y, 10.0, Regular, line));
        }
    }

    ops.push(DrawOp::Rule {
        y: 270.0,
        from_x: LEFT,
        to_x: RIGHT,
    });
    let footer = if invoice.is_paid() {
        "This invoice has been settled.".to_string()
    } else {
        config.invoice.footer_text.clone()
    };
    ops.push(DrawOp::text(LEFT, 276.0, 9.0, Regular, footer));
    ops.push(DrawOp::text(LEFT, 281.0, 9.0, Regular, config.invoice.thank_you_text.clone()));
    ops.push(DrawOp::text(
        LEFT,
        287.0,
        8.0,
        Regular,
        format!("{} | Managing director: {}", company.name, company.managing_director),
    ));
    ops
}

/// Identity stamped into the document catalog and trailer.
#[derive(Debug, Clone)]
pub struct DocumentStamp<'a> {
    pub title: &'a str,
    pub document_id: &'a str,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

fn pdf_date(at: DateTime<Utc>) -> Result<OffsetDateTime, anyhow::Error> {
    Ok(OffsetDateTime::from_unix_timestamp(at.timestamp())?)
}

/// Encode drawing operations as a single-page A4 document.
///
/// The output depends only on `stamp` and `ops`: dates come from the stamp, XMP metadata is
/// left out and the trailer id is pinned to the document id.
pub fn encode(stamp: &DocumentStamp<'_>, ops: &[DrawOp]) -> Result<Vec<u8>, anyhow::Error> {
    let (doc, page, layer) = PdfDocument::new(stamp.title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
    let doc = doc
        .with_conformance(PdfConformance::Custom(CustomPdfConformance {
            identifier: "billing-invoice".to_string(),
            requires_xmp_metadata: false,
            requires_icc_profile: false,
            ..CustomPdfConformance::default()
        }))
        .with_document_id(stamp.document_id.to_string())
        .with_creation_date(pdf_date(stamp.created_at)?)
        .with_mod_date(pdf_date(stamp.modified_at)?)
        .with_metadata_date(pdf_date(stamp.modified_at)?);
    let regular = doc.add_builtin_font(BuiltinFont::Helvetica)?;
    let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold)?;
    let layer = doc.get_page(page).get_layer(layer);
    layer.set_outline_thickness(0.5);

    for op in ops {
        match op {
            DrawOp::Text {
                x,
                y,
                size,
                weight,
                text,
            } => {
                let font: &IndirectFontRef = match weight {
                    FontWeight::Regular => &regular,
                    FontWeight::Bold => &bold,
                };
                layer.use_text(text.as_str(), *size, Mm(*x), Mm(PAGE_HEIGHT - *y), font);
            }
            DrawOp::Rule { y, from_x, to_x } => {
                layer.add_line(Line {
                    points: vec![
                        (Point::new(Mm(*from_x), Mm(PAGE_HEIGHT - *y)), false),
                        (Point::new(Mm(*to_x), Mm(PAGE_HEIGHT - *y)), false),
                    ],
                    is_closed: false,
                });
            }
        }
    }

    drop(layer);
    pin_trailer_id(&doc.save_to_bytes()?, stamp.document_id)
}

/// printpdf writes a random instance id into the trailer on every save; replace it.
fn pin_trailer_id(bytes: &[u8], document_id: &str) -> Result<Vec<u8>, anyhow::Error> {
    let mut document = lopdf::Document::load_mem(bytes)?;
    let id = || Object::String(document_id.as_bytes().to_vec(), StringFormat::Literal);
    document.trailer.set("ID", Object::Array(vec![id(), id()]));
    let mut out = Vec::with_capacity(bytes.len());
    document.save_to(&mut out)?;
    Ok(out)
}

pub fn render_invoice(
    invoice: &Invoice,
    tenant: &TenantProfile,
    config: &InvoiceDocumentConfig,
) -> Result<Vec<u8>, anyhow::Error> {
    let ops = layout(invoice, tenant, config);
    let title = format!("Invoice {}", invoice.invoice_number);
    let document_id = invoice.artifact_key();
    encode(
        &DocumentStamp {
            title: &title,
            document_id: &document_id,
            created_at: invoice.created_at,
            modified_at: invoice.paid_at.unwrap_or(invoice.created_at),
        },
        &ops,
    )
}

#[derive(Clone)]
pub struct PdfGenerator {
    engine: InvoiceEngine,
    store: Arc<dyn BillingStore>,
    blobs: Arc<dyn BlobStore>,
    locks: Arc<KeyedLocks>,
    url_expiry_secs: u64,
}

impl PdfGenerator {
    pub fn new(
        engine: InvoiceEngine,
        store: Arc<dyn BillingStore>,
        blobs: Arc<dyn BlobStore>,
        url_expiry_secs: u64,
    ) -> Self {
        Self {
            engine,
            store,
            blobs,
            locks: Arc::new(KeyedLocks::new()),
            url_expiry_secs,
        }
    }

    /// Stored document config, falling back to the built-in letterhead.
    pub async fn document_config(&self) -> InvoiceDocumentConfig {
        match self.blobs.get(DOCUMENT_CONFIG_KEY).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Invalid invoice document config, using defaults");
                InvoiceDocumentConfig::default()
            }),
            Ok(None) => InvoiceDocumentConfig::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Invoice document config unavailable, using defaults");
                InvoiceDocumentConfig::default()
            }
        }
    }

    /// Signed download url for the invoice PDF, rendering and uploading it when missing.
    pub async fn get_or_create_invoice_pdf(
        &self,
        tenant_id: &str,
        id_or_number: &str,
    ) -> Result<String, BillingError> {
        let invoice = self.engine.get_invoice(tenant_id, id_or_number).await?;
        let key = invoice.artifact_key();

        let _guard = self.locks.lock(&key).await;

        if self.blobs.head_exists(&key).await? {
            metrics::record_pdf_generated("cached");
        } else {
            let tenant = self
                .store
                .get_tenant(tenant_id)
                .await?
                .unwrap_or_else(|| TenantProfile::new(tenant_id));
            let config = self.document_config().await;
            let bytes = render_invoice(&invoice, &tenant, &config)?;
            self.blobs.put(&key, bytes, "application/pdf").await?;
            self.store.set_invoice_pdf_key(&invoice.invoice_id, &key).await?;
            metrics::record_pdf_generated("generated");
            tracing::info!(
                tenant_id = %tenant_id,
                invoice_id = %invoice.invoice_id,
                pdf_key = %key,
                "Invoice PDF generated"
            );
        }

        Ok(self
            .blobs
            .signed_url(&key, self.url_expiry_secs, &invoice.download_filename())?)
    }
}
