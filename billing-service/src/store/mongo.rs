use super::{BillingStore, StoreError};
use crate::models::{
    CustomerProvider, Invoice, InvoiceStatus, MemberSubscription, MollieConnectAccount,
    PaymentMethodInfo, RawWebhookEvent, StripeSubscriptionState, TenantBillingAccount, TenantProfile,
    TenantStatus, WebhookOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, Bson, Document},
    error::{ErrorKind, WriteFailure},
    options::{FindOneAndUpdateOptions, IndexOptions, ReplaceOptions, ReturnDocument},
    Client as MongoClient, Collection, Database, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};

const DUPLICATE_KEY_CODE: i32 = 11000;

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY_CODE,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

fn status_list(statuses: &[InvoiceStatus]) -> Vec<&'static str> {
    statuses.iter().map(InvoiceStatus::as_str).collect()
}

/// Status and payment fields of an invoice transition. `period_lock` is unset rather than
/// nulled so the sparse unique index releases the period.
fn invoice_state_update(invoice: &Invoice) -> Result<Document, StoreError> {
    let mut set = doc! {
        "status": invoice.status.as_str(),
        "payment_method": bson::to_bson(&invoice.payment_method)?,
        "provider_payment_id": bson::to_bson(&invoice.provider_payment_id)?,
        "payment_status": bson::to_bson(&invoice.payment_status)?,
        "payment_error": bson::to_bson(&invoice.payment_error)?,
        "payment_details": bson::to_bson(&invoice.payment_details)?,
        "paid_at": bson::to_bson(&invoice.paid_at)?,
        "updated_at": bson::to_bson(&invoice.updated_at)?,
    };
    let mut update = Document::new();
    match &invoice.period_lock {
        Some(lock) => {
            set.insert("period_lock", lock.as_str());
        }
        None => {
            update.insert("$unset", doc! { "period_lock": "" });
        }
    }
    update.insert("$set", set);
    Ok(update)
}

fn setup_pending_filter(tenant_id: &str, setup_payment_id: &str) -> Document {
    doc! {
        "_id": tenant_id,
        "mandate_status": "pending",
        "setup_payment_id": setup_payment_id,
    }
}

#[derive(Clone)]
pub struct MongoBillingStore {
    client: MongoClient,
    db: Database,
}

impl MongoBillingStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        tracing::info!(database = %database, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to MongoDB");
            StoreError::from(e)
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Connected to MongoDB");
        Ok(Self { client, db })
    }

    pub async fn init_indexes(&self) -> Result<(), StoreError> {
        tracing::info!("Creating MongoDB indexes for billing-service");

        // At most one non-void invoice per tenant and month. Sparse, so voided
        // invoices without a lock do not collide.
        let period_lock = IndexModel::builder()
            .keys(doc! { "period_lock": 1 })
            .options(
                IndexOptions::builder()
                    .name("invoice_period_lock".to_string())
                    .unique(true)
                    .sparse(true)
                    .build(),
            )
            .build();
        let tenant_created = IndexModel::builder()
            .keys(doc! { "tenant_id": 1, "created_at": -1 })
            .options(IndexOptions::builder().name("invoice_tenant_created".to_string()).build())
            .build();
        let tenant_number = IndexModel::builder()
            .keys(doc! { "tenant_id": 1, "invoice_number": 1 })
            .options(IndexOptions::builder().name("invoice_tenant_number".to_string()).build())
            .build();
        let payment_id = IndexModel::builder()
            .keys(doc! { "provider_payment_id": 1 })
            .options(IndexOptions::builder().name("invoice_payment_id".to_string()).build())
            .build();

        self.invoices()
            .create_indexes(vec![period_lock, tenant_created, tenant_number, payment_id], None)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create indexes on invoices");
                StoreError::from(e)
            })?;

        let mandate_status = IndexModel::builder()
            .keys(doc! { "mandate_status": 1 })
            .options(IndexOptions::builder().name("account_mandate_status".to_string()).build())
            .build();
        self.accounts()
            .create_index(mandate_status, None)
            .await
            .map_err(StoreError::from)?;

        let member_tenant = IndexModel::builder()
            .keys(doc! { "tenant_id": 1, "customer_id": 1 })
            .options(IndexOptions::builder().name("member_tenant_customer".to_string()).build())
            .build();
        let member_mandate = IndexModel::builder()
            .keys(doc! { "mandate_payment_id": 1 })
            .options(IndexOptions::builder().name("member_mandate_payment".to_string()).build())
            .build();
        self.members()
            .create_indexes(vec![member_tenant, member_mandate], None)
            .await
            .map_err(StoreError::from)?;

        let received = IndexModel::builder()
            .keys(doc! { "received_at": -1 })
            .options(IndexOptions::builder().name("webhook_received_at".to_string()).build())
            .build();
        self.webhook_events()
            .create_index(received, None)
            .await
            .map_err(StoreError::from)?;

        tracing::info!("MongoDB indexes ready");
        Ok(())
    }

    fn accounts(&self) -> Collection<TenantBillingAccount> {
        self.db.collection("billing_accounts")
    }

    fn invoices(&self) -> Collection<Invoice> {
        self.db.collection("invoices")
    }

    fn connect_accounts(&self) -> Collection<MollieConnectAccount> {
        self.db.collection("connect_accounts")
    }

    fn members(&self) -> Collection<MemberSubscription> {
        self.db.collection("member_subscriptions")
    }

    fn tenants(&self) -> Collection<TenantProfile> {
        self.db.collection("tenants")
    }

    fn webhook_events(&self) -> Collection<RawWebhookEvent> {
        self.db.collection("webhook_events")
    }

    async fn find_many<T>(collection: &Collection<T>, filter: Document) -> Result<Vec<T>, StoreError>
    where
        T: DeserializeOwned + Unpin + Send + Sync,
    {
        let cursor = collection.find(filter, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn set_account_fields(&self, filter: Document, set: Document) -> Result<bool, StoreError> {
        let result = self
            .accounts()
            .update_one(filter, doc! { "$set": set }, None)
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn upsert<T>(collection: &Collection<T>, id: &str, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + Send + Sync,
    {
        let options = ReplaceOptions::builder().upsert(true).build();
        collection
            .replace_one(doc! { "_id": id }, value, options)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BillingStore for MongoBillingStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "MongoDB health check failed");
                StoreError::from(e)
            })?;
        Ok(())
    }

    async fn get_account(&self, tenant_id: &str) -> Result<Option<TenantBillingAccount>, StoreError> {
        Ok(self.accounts().find_one(doc! { "_id": tenant_id }, None).await?)
    }

    async fn create_account_if_absent(&self, account: &TenantBillingAccount) -> Result<bool, StoreError> {
        match self.accounts().insert_one(account, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_account_customer_id(
        &self,
        tenant_id: &str,
        provider: CustomerProvider,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut set = doc! { "updated_at": bson::to_bson(&now)? };
        set.insert(provider.field(), customer_id);
        self.set_account_fields(doc! { "_id": tenant_id }, set).await?;
        Ok(())
    }

    async fn set_account_payment_method(
        &self,
        tenant_id: &str,
        payment_method: &PaymentMethodInfo,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let set = doc! {
            "payment_method": bson::to_bson(payment_method)?,
            "updated_at": bson::to_bson(&now)?,
        };
        self.set_account_fields(doc! { "_id": tenant_id }, set).await?;
        Ok(())
    }

    async fn clear_account_payment_method(
        &self,
        tenant_id: &str,
        payment_method_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = self
            .accounts()
            .update_one(
                doc! { "_id": tenant_id, "payment_method.id": payment_method_id },
                doc! {
                    "$unset": { "payment_method": "" },
                    "$set": { "updated_at": bson::to_bson(&now)? },
                },
                None,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn set_account_stripe_subscription(
        &self,
        tenant_id: &str,
        subscription: &StripeSubscriptionState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let set = doc! {
            "stripe_subscription": bson::to_bson(subscription)?,
            "updated_at": bson::to_bson(&now)?,
        };
        self.set_account_fields(doc! { "_id": tenant_id }, set).await?;
        Ok(())
    }

    async fn adopt_account_mandate(
        &self,
        tenant_id: &str,
        mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let filter = doc! { "_id": tenant_id, "mandate_status": { "$ne": "revoked" } };
        let set = doc! {
            "mandate_id": mandate_id,
            "mandate_status": "active",
            "updated_at": bson::to_bson(&now)?,
        };
        self.set_account_fields(filter, set).await
    }

    async fn begin_account_mandate_setup(
        &self,
        tenant_id: &str,
        setup_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let pipeline = vec![doc! {
            "$set": {
                "mandate_id": Bson::Null,
                "mandate_status": "pending",
                "setup_payment_id": setup_payment_id,
                "subscription_status": {
                    "$cond": [
                        { "$eq": ["$subscription_status", "active"] },
                        "inactive",
                        "$subscription_status",
                    ]
                },
                "updated_at": bson::to_bson(&now)?,
            }
        }];
        self.accounts()
            .update_one(doc! { "_id": tenant_id }, pipeline, None)
            .await?;
        Ok(())
    }

    async fn activate_account_mandate(
        &self,
        tenant_id: &str,
        setup_payment_id: &str,
        mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = bson::to_bson(&now)?;
        let set = doc! {
            "mandate_id": mandate_id,
            "mandate_status": "active",
            "subscription_status": "active",
            "subscription_activated_at": now.clone(),
            "subscription_cancelled_at": Bson::Null,
            "last_payment_at": now.clone(),
            "updated_at": now,
        };
        self.set_account_fields(setup_pending_filter(tenant_id, setup_payment_id), set)
            .await
    }

    async fn fail_account_mandate_setup(
        &self,
        tenant_id: &str,
        setup_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let set = doc! {
            "mandate_status": "none",
            "setup_payment_id": Bson::Null,
            "subscription_status": "inactive",
            "updated_at": bson::to_bson(&now)?,
        };
        self.set_account_fields(setup_pending_filter(tenant_id, setup_payment_id), set)
            .await
    }

    async fn record_account_payment(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let now = bson::to_bson(&now)?;
        self.set_account_fields(
            doc! { "_id": tenant_id },
            doc! { "last_payment_at": now.clone(), "updated_at": now.clone() },
        )
        .await?;
        self.set_account_fields(
            doc! {
                "_id": tenant_id,
                "mandate_status": "active",
                "subscription_status": { "$ne": "active" },
            },
            doc! { "subscription_status": "active", "subscription_activated_at": now },
        )
        .await?;
        Ok(())
    }

    async fn record_account_payment_failure(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_account_fields(
            doc! { "_id": tenant_id, "subscription_status": "active" },
            doc! { "subscription_status": "inactive", "updated_at": bson::to_bson(&now)? },
        )
        .await?;
        Ok(())
    }

    async fn revoke_account(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TenantBillingAccount>, StoreError> {
        let now = bson::to_bson(&now)?;
        let update = doc! {
            "$set": {
                "mandate_status": "revoked",
                "mandate_id": Bson::Null,
                "setup_payment_id": Bson::Null,
                "subscription_status": "cancelled",
                "subscription_cancelled_at": now.clone(),
                "updated_at": now,
            }
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .accounts()
            .find_one_and_update(doc! { "_id": tenant_id }, update, options)
            .await?)
    }

    async fn list_accounts_with_active_mandate(&self) -> Result<Vec<TenantBillingAccount>, StoreError> {
        let mut accounts = Self::find_many(&self.accounts(), doc! { "mandate_status": "active" }).await?;
        accounts.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(accounts)
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        match self.invoices().insert_one(invoice, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(StoreError::Duplicate(
                invoice
                    .period_lock
                    .clone()
                    .unwrap_or_else(|| invoice.invoice_id.clone()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self.invoices().find_one(doc! { "_id": invoice_id }, None).await?)
    }

    async fn find_invoice_by_number(
        &self,
        tenant_id: &str,
        invoice_number: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        let filter = doc! { "tenant_id": tenant_id, "invoice_number": invoice_number };
        Ok(self.invoices().find_one(filter, None).await?)
    }

    async fn find_invoice_by_period_lock(&self, period_lock: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .invoices()
            .find_one(doc! { "period_lock": period_lock }, None)
            .await?)
    }

    async fn find_invoice_by_payment_id(&self, provider_payment_id: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .invoices()
            .find_one(doc! { "provider_payment_id": provider_payment_id }, None)
            .await?)
    }

    async fn list_invoices(&self, tenant_id: &str) -> Result<Vec<Invoice>, StoreError> {
        let mut invoices = Self::find_many(&self.invoices(), doc! { "tenant_id": tenant_id }).await?;
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }

    async fn list_all_invoices(&self) -> Result<Vec<Invoice>, StoreError> {
        let mut invoices = Self::find_many(&self.invoices(), doc! {}).await?;
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }

    async fn update_invoice_if(
        &self,
        invoice: &Invoice,
        expected: &[InvoiceStatus],
    ) -> Result<bool, StoreError> {
        let filter = doc! {
            "_id": &invoice.invoice_id,
            "status": { "$in": status_list(expected) },
        };
        let result = self
            .invoices()
            .update_one(filter, invoice_state_update(invoice)?, None)
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn set_invoice_pdf_key(&self, invoice_id: &str, pdf_key: &str) -> Result<(), StoreError> {
        self.invoices()
            .update_one(
                doc! { "_id": invoice_id },
                doc! { "$set": { "pdf_key": pdf_key } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn get_connect_account(&self, tenant_id: &str) -> Result<Option<MollieConnectAccount>, StoreError> {
        Ok(self
            .connect_accounts()
            .find_one(doc! { "_id": tenant_id }, None)
            .await?)
    }

    async fn put_connect_account(&self, account: &MollieConnectAccount) -> Result<(), StoreError> {
        Self::upsert(&self.connect_accounts(), &account.tenant_id, account).await
    }

    async fn list_connected_accounts(&self) -> Result<Vec<MollieConnectAccount>, StoreError> {
        Self::find_many(&self.connect_accounts(), doc! { "status": "connected" }).await
    }

    async fn get_member(&self, tenant_id: &str, member_id: &str) -> Result<Option<MemberSubscription>, StoreError> {
        let key = MemberSubscription::key(tenant_id, member_id);
        Ok(self.members().find_one(doc! { "_id": key }, None).await?)
    }

    async fn put_member(&self, member: &MemberSubscription) -> Result<(), StoreError> {
        Self::upsert(&self.members(), &member.id, member).await
    }

    async fn list_members(&self, tenant_id: &str) -> Result<Vec<MemberSubscription>, StoreError> {
        let mut members = Self::find_many(&self.members(), doc! { "tenant_id": tenant_id }).await?;
        members.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(members)
    }

    async fn find_member_by_mandate_payment(&self, payment_id: &str) -> Result<Option<MemberSubscription>, StoreError> {
        Ok(self
            .members()
            .find_one(doc! { "mandate_payment_id": payment_id }, None)
            .await?)
    }

    async fn find_member_by_customer(
        &self,
        tenant_id: &str,
        customer_id: &str,
    ) -> Result<Option<MemberSubscription>, StoreError> {
        let filter = doc! { "tenant_id": tenant_id, "customer_id": customer_id };
        Ok(self.members().find_one(filter, None).await?)
    }

    async fn replace_member_if_payment_new(
        &self,
        member: &MemberSubscription,
        payment_id: &str,
    ) -> Result<bool, StoreError> {
        let filter = doc! {
            "_id": &member.id,
            "applied_payment_ids": { "$ne": payment_id },
        };
        let result = self.members().replace_one(filter, member, None).await?;
        Ok(result.matched_count == 1)
    }

    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantProfile>, StoreError> {
        Ok(self.tenants().find_one(doc! { "_id": tenant_id }, None).await?)
    }

    async fn put_tenant(&self, tenant: &TenantProfile) -> Result<(), StoreError> {
        Self::upsert(&self.tenants(), &tenant.tenant_id, tenant).await
    }

    async fn list_tenants(&self) -> Result<Vec<TenantProfile>, StoreError> {
        let mut tenants = Self::find_many(&self.tenants(), doc! {}).await?;
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(tenants)
    }

    async fn set_tenant_status(
        &self,
        tenant_id: &str,
        status: TenantStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = self
            .tenants()
            .update_one(
                doc! { "_id": tenant_id },
                doc! { "$set": {
                    "status": status.as_str(),
                    "status_reason": reason,
                    "status_updated_at": bson::to_bson(&now)?,
                } },
                None,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn activate_tenant_if_inactive(&self, tenant_id: &str) -> Result<bool, StoreError> {
        let result = self
            .tenants()
            .update_one(
                doc! { "_id": tenant_id, "status": { "$ne": "active" } },
                doc! { "$set": { "status": "active", "billing_active": true } },
                None,
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn record_webhook_event(&self, event: &RawWebhookEvent) -> Result<(), StoreError> {
        self.webhook_events().insert_one(event, None).await?;
        Ok(())
    }

    async fn set_webhook_outcome(
        &self,
        event_id: &str,
        payment_id: Option<&str>,
        outcome: &WebhookOutcome,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut set = doc! {
            "outcome": bson::to_bson(outcome)?,
            "processed_at": bson::to_bson(&processed_at)?,
        };
        if let Some(payment_id) = payment_id {
            set.insert("payment_id", payment_id);
        }
        self.webhook_events()
            .update_one(doc! { "_id": event_id }, doc! { "$set": set }, None)
            .await?;
        Ok(())
    }

    async fn get_webhook_event(&self, event_id: &str) -> Result<Option<RawWebhookEvent>, StoreError> {
        Ok(self
            .webhook_events()
            .find_one(doc! { "_id": event_id }, None)
            .await?)
    }
}
