//! Invoice lifecycle.
//!
//! Every transition is checked in the same order: action permission, input
//! validation, load, record-level permission, state guards. Records are then
//! persisted through the `DataStore`, which refuses to move `paid`,
//! `withdrawn` or `cancelled` backwards.

use crate::models::{
    compute_totals, CreateInvoiceInput, Invoice, InvoiceChange, InvoiceStatus, LifecycleState,
    LineItem, LineItemInput, PayInput, PaymentMethod, Totals, UpdateInvoiceInput, User,
};
use crate::services::metrics::{ERRORS_TOTAL, INVOICE_EVENTS_TOTAL, PAYMENTS_TOTAL};
use crate::services::permissions::{can_perform, InvoiceAction};
use crate::services::store::{ClientActivity, ClientStats, DataStore, InvoiceNumbering};
use chrono::{DateTime, Utc};
use service_core::error::{field_error, AppError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

/// Reason recorded when an owner deletes an invoice.
pub const DELETE_REASON: &str = "Deleted by owner";

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("Not allowed to {0} this invoice")]
    PermissionDenied(&'static str),

    #[error("Invoice not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(ValidationErrors),

    #[error("Invoice is already paid")]
    AlreadyPaid,

    #[error("Invoice is not paid")]
    NotPaid,

    #[error("Invoice is already withdrawn")]
    AlreadyWithdrawn,

    #[error("Invoice is already cancelled")]
    AlreadyCancelled,

    #[error("Invoice is cancelled")]
    Cancelled,

    #[error("Invoice can no longer be modified")]
    NotModifiable,

    #[error("Invoice numbering failed: {0}")]
    Dependency(AppError),

    #[error(transparent)]
    Store(AppError),
}

impl InvoiceError {
    /// Whether the failure means the data store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            InvoiceError::Store(AppError::ServiceUnavailable)
                | InvoiceError::Dependency(AppError::ServiceUnavailable)
        )
    }

    /// Whether the failure is a state conflict on an existing record.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            InvoiceError::AlreadyPaid
                | InvoiceError::NotPaid
                | InvoiceError::AlreadyWithdrawn
                | InvoiceError::AlreadyCancelled
                | InvoiceError::Cancelled
                | InvoiceError::NotModifiable
        )
    }

    /// Whether a repeated delivery of the same transition explains the
    /// failure: the record already sits in the state the transition targets.
    pub fn is_already_applied(&self) -> bool {
        matches!(
            self,
            InvoiceError::AlreadyPaid
                | InvoiceError::AlreadyWithdrawn
                | InvoiceError::AlreadyCancelled
        )
    }

    fn invalid(field: &'static str, code: &'static str, message: &'static str) -> Self {
        let mut errors = ValidationErrors::new();
        errors.add(field, field_error(code, message));
        InvoiceError::Validation(errors)
    }
}

impl From<InvoiceError> for AppError {
    fn from(err: InvoiceError) -> Self {
        match err {
            InvoiceError::PermissionDenied(_) => AppError::Forbidden(anyhow::anyhow!(err.to_string())),
            InvoiceError::NotFound => AppError::NotFound(anyhow::anyhow!("Invoice not found")),
            InvoiceError::Validation(errors) => AppError::ValidationError(errors),
            InvoiceError::Dependency(AppError::ServiceUnavailable) => AppError::ServiceUnavailable,
            InvoiceError::Dependency(inner) => {
                AppError::DependencyError(anyhow::anyhow!("Invoice numbering failed: {}", inner))
            }
            InvoiceError::Store(inner) => inner,
            conflict => AppError::Conflict(anyhow::anyhow!(conflict.to_string())),
        }
    }
}

/// Whitespace-only names pass the length rule; flag them unless it already fired.
fn blank_client_name(errors: &mut ValidationErrors, message: &'static str) {
    if !errors.errors().contains_key("client_name") {
        errors.add("client_name", field_error("length", message));
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Executes invoice transitions for an authenticated user.
#[derive(Clone)]
pub struct InvoiceService {
    store: Arc<dyn DataStore>,
    numbering: Arc<dyn InvoiceNumbering>,
    client_stats: Arc<dyn ClientStats>,
}

impl InvoiceService {
    pub fn new(
        store: Arc<dyn DataStore>,
        numbering: Arc<dyn InvoiceNumbering>,
        client_stats: Arc<dyn ClientStats>,
    ) -> Self {
        Self {
            store,
            numbering,
            client_stats,
        }
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    fn authorize(
        actor: &User,
        action: InvoiceAction,
        invoice: Option<&Invoice>,
    ) -> Result<(), InvoiceError> {
        if can_perform(actor, action, invoice) {
            Ok(())
        } else {
            warn!(user_id = %actor.id, action = action.as_str(), "Permission denied");
            Err(InvoiceError::PermissionDenied(action.as_str()))
        }
    }

    async fn find(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Option<Invoice>, InvoiceError> {
        self.store
            .get_invoice(tenant_id, invoice_id)
            .await
            .map_err(InvoiceError::Store)
    }

    async fn load(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Invoice, InvoiceError> {
        self.find(tenant_id, invoice_id)
            .await?
            .ok_or(InvoiceError::NotFound)
    }

    /// Write `invoice` unless another writer moved its lifecycle since it
    /// was loaded. A lost race re-runs `guard` on the current record so the
    /// caller gets the error a later load would have produced.
    async fn save<G>(
        &self,
        invoice: &Invoice,
        loaded: LifecycleState,
        guard: G,
    ) -> Result<Invoice, InvoiceError>
    where
        G: Fn(&Invoice) -> Result<(), InvoiceError>,
    {
        match self.store.save_invoice(invoice, loaded).await {
            Err(AppError::Conflict(e)) => {
                let current = self.load(invoice.tenant_id, invoice.id).await?;
                guard(&current)?;
                Err(InvoiceError::Store(AppError::Conflict(e)))
            }
            other => other.map_err(InvoiceError::Store),
        }
    }

    fn ensure_payable(invoice: &Invoice) -> Result<(), InvoiceError> {
        if invoice.is_cancelled() {
            return Err(InvoiceError::Cancelled);
        }
        if invoice.paid {
            return Err(InvoiceError::AlreadyPaid);
        }
        Ok(())
    }

    fn ensure_withdrawable(invoice: &Invoice) -> Result<(), InvoiceError> {
        if invoice.is_cancelled() {
            return Err(InvoiceError::Cancelled);
        }
        if !invoice.paid {
            return Err(InvoiceError::NotPaid);
        }
        if invoice.withdrawn {
            return Err(InvoiceError::AlreadyWithdrawn);
        }
        Ok(())
    }

    fn ensure_cancellable(invoice: &Invoice) -> Result<(), InvoiceError> {
        if invoice.is_cancelled() {
            return Err(InvoiceError::AlreadyCancelled);
        }
        Ok(())
    }

    fn touch(invoice: &mut Invoice, actor: &User, now: DateTime<Utc>) {
        invoice.modified_at = Some(now);
        invoice.modified_by = Some(actor.id);
        invoice.modified_by_name = Some(actor.display_name.clone());
    }

    /// Update client aggregates in the background. Failures are logged only.
    fn record_client_activity(&self, invoice: &Invoice, activity: ClientActivity) {
        let Some(phone) = non_empty(&invoice.client_phone).map(str::to_string) else {
            return;
        };
        let stats = Arc::clone(&self.client_stats);
        let tenant_id = invoice.tenant_id;
        let invoice_id = invoice.id;
        let name = invoice.client_name.clone();

        tokio::spawn(async move {
            if let Err(e) = stats
                .record_activity(tenant_id, &phone, &name, activity)
                .await
            {
                ERRORS_TOTAL.with_label_values(&["client_stats"]).inc();
                warn!(
                    tenant_id = %tenant_id,
                    invoice_id = %invoice_id,
                    error = %e,
                    "Client statistics update failed"
                );
            }
        });
    }

    /// Validate a create input and price its line items.
    pub fn price(input: &CreateInvoiceInput) -> Result<(Vec<LineItem>, Totals), InvoiceError> {
        let mut errors = input.validate().err().unwrap_or_else(ValidationErrors::new);
        if input.client_name.trim().is_empty() {
            blank_client_name(&mut errors, "Client name is required");
        }
        let priced = compute_totals(&input.items, input.discount.as_ref(), input.tax, &mut errors);
        match priced {
            Some(priced) if errors.errors().is_empty() => Ok(priced),
            _ => Err(InvoiceError::Validation(errors)),
        }
    }

    /// Checks that need no stored record: the action grant and the shape of
    /// the change. Used before queueing a mutation while offline.
    pub fn precheck(actor: &User, change: &InvoiceChange) -> Result<(), InvoiceError> {
        match change {
            InvoiceChange::Pay(input) => {
                Self::authorize(actor, InvoiceAction::Pay, None)?;
                Self::payment_method(input).map(|_| ())
            }
            InvoiceChange::Withdraw { .. } => Self::authorize(actor, InvoiceAction::Withdraw, None),
            InvoiceChange::Duplicate { .. } => {
                Self::authorize(actor, InvoiceAction::Duplicate, None)
            }
            InvoiceChange::Cancel { reason } => Self::cancellation_reason(reason).map(|_| ()),
            InvoiceChange::Update(patch) => patch.validate().map_err(InvoiceError::Validation),
        }
    }

    pub fn precheck_create(actor: &User, input: &CreateInvoiceInput) -> Result<(), InvoiceError> {
        Self::authorize(actor, InvoiceAction::Create, None)?;
        Self::price(input).map(|_| ())
    }

    pub fn precheck_delete(actor: &User) -> Result<(), InvoiceError> {
        Self::authorize(actor, InvoiceAction::Delete, None)
    }

    fn payment_method(input: &PayInput) -> Result<PaymentMethod, InvoiceError> {
        match non_empty(&input.method) {
            None => Err(InvoiceError::invalid(
                "method",
                "required",
                "Payment method is required",
            )),
            Some(raw) => raw
                .parse::<PaymentMethod>()
                .map_err(|_| InvoiceError::invalid("method", "invalid", "Unknown payment method")),
        }
    }

    fn cancellation_reason(reason: &str) -> Result<&str, InvoiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(InvoiceError::invalid(
                "reason",
                "required",
                "Cancellation reason is required",
            ));
        }
        Ok(reason)
    }

    #[instrument(skip(self, actor), fields(tenant_id = %actor.tenant_id, user_id = %actor.id, invoice_id = %invoice_id))]
    pub async fn get(&self, actor: &User, invoice_id: Uuid) -> Result<Invoice, InvoiceError> {
        self.load(actor.tenant_id, invoice_id).await
    }

    /// Create an invoice. A repeated create with the same client id returns
    /// the stored invoice without allocating a new number.
    #[instrument(skip(self, actor, input), fields(tenant_id = %actor.tenant_id, user_id = %actor.id))]
    pub async fn create(
        &self,
        actor: &User,
        input: CreateInvoiceInput,
    ) -> Result<Invoice, InvoiceError> {
        Self::authorize(actor, InvoiceAction::Create, None)?;
        let (items, totals) = Self::price(&input)?;

        if let Some(id) = input.id {
            if let Some(existing) = self.find(actor.tenant_id, id).await? {
                info!(invoice_id = %id, "Invoice already exists, create is a no-op");
                return Ok(existing);
            }
        }

        let number = self
            .numbering
            .next_number(actor.tenant_id)
            .await
            .map_err(InvoiceError::Dependency)?;

        let now = Utc::now();
        let invoice = Invoice {
            id: input.id.unwrap_or_else(Uuid::new_v4),
            tenant_id: actor.tenant_id,
            number,
            client_name: input.client_name.trim().to_string(),
            client_phone: input.client_phone,
            client_email: input.client_email,
            client_address: input.client_address,
            items,
            subtotal: totals.subtotal,
            discount: input.discount,
            discount_amount: totals.discount_amount,
            tax: input.tax,
            total: totals.total,
            status: InvoiceStatus::Active,
            paid: false,
            withdrawn: false,
            payment_method: None,
            deposit_date: input.deposit_date.unwrap_or(now),
            estimated_ready_date: input.estimated_ready_date,
            payment_date: None,
            withdrawal_date: None,
            cancelled_at: None,
            cancellation_reason: None,
            cancelled_by: None,
            cancelled_by_name: None,
            created_at: now,
            created_by: actor.id,
            created_by_name: actor.display_name.clone(),
            modified_at: None,
            modified_by: None,
            modified_by_name: None,
            urgency: input.urgency,
            tags: input.tags,
            notes: input.notes,
            source_invoice_id: None,
        };

        let stored = match self.store.insert_invoice(&invoice).await {
            Ok(stored) => stored,
            // Lost a race against an identical create.
            Err(AppError::Conflict(_)) if input.id.is_some() => {
                return self.load(actor.tenant_id, invoice.id).await;
            }
            Err(e) => return Err(InvoiceError::Store(e)),
        };

        INVOICE_EVENTS_TOTAL.with_label_values(&["created"]).inc();
        info!(invoice_id = %stored.id, number = %stored.number, total = %stored.total, "Invoice created");

        self.record_client_activity(&stored, ClientActivity::Visit);
        Ok(stored)
    }

    #[instrument(skip(self, actor, input), fields(tenant_id = %actor.tenant_id, user_id = %actor.id, invoice_id = %invoice_id))]
    pub async fn pay(
        &self,
        actor: &User,
        invoice_id: Uuid,
        input: PayInput,
    ) -> Result<Invoice, InvoiceError> {
        Self::authorize(actor, InvoiceAction::Pay, None)?;

        let method = Self::payment_method(&input)?;

        let mut invoice = self.load(actor.tenant_id, invoice_id).await?;
        Self::ensure_payable(&invoice)?;
        let loaded = invoice.lifecycle();

        let now = Utc::now();
        invoice.paid = true;
        invoice.payment_method = Some(method);
        invoice.payment_date = Some(input.date.unwrap_or(now));
        Self::touch(&mut invoice, actor, now);

        let saved = self.save(&invoice, loaded, Self::ensure_payable).await?;

        INVOICE_EVENTS_TOTAL.with_label_values(&["paid"]).inc();
        PAYMENTS_TOTAL.with_label_values(&[method.as_str()]).inc();
        info!(number = %saved.number, method = method.as_str(), "Invoice paid");

        self.record_client_activity(&saved, ClientActivity::Payment(saved.total));
        Ok(saved)
    }

    #[instrument(skip(self, actor), fields(tenant_id = %actor.tenant_id, user_id = %actor.id, invoice_id = %invoice_id))]
    pub async fn withdraw(
        &self,
        actor: &User,
        invoice_id: Uuid,
        date: Option<DateTime<Utc>>,
    ) -> Result<Invoice, InvoiceError> {
        Self::authorize(actor, InvoiceAction::Withdraw, None)?;

        let mut invoice = self.load(actor.tenant_id, invoice_id).await?;
        Self::ensure_withdrawable(&invoice)?;
        let loaded = invoice.lifecycle();

        let now = Utc::now();
        invoice.withdrawn = true;
        invoice.withdrawal_date = Some(date.unwrap_or(now));
        Self::touch(&mut invoice, actor, now);

        let saved = self
            .save(&invoice, loaded, Self::ensure_withdrawable)
            .await?;

        INVOICE_EVENTS_TOTAL.with_label_values(&["withdrawn"]).inc();
        info!(number = %saved.number, "Invoice withdrawn");
        Ok(saved)
    }

    #[instrument(skip(self, actor, reason), fields(tenant_id = %actor.tenant_id, user_id = %actor.id, invoice_id = %invoice_id))]
    pub async fn cancel(
        &self,
        actor: &User,
        invoice_id: Uuid,
        reason: &str,
    ) -> Result<Invoice, InvoiceError> {
        let reason = Self::cancellation_reason(reason)?;

        let mut invoice = self.load(actor.tenant_id, invoice_id).await?;
        Self::authorize(actor, InvoiceAction::Cancel, Some(&invoice))?;
        Self::ensure_cancellable(&invoice)?;
        let loaded = invoice.lifecycle();

        let now = Utc::now();
        invoice.status = InvoiceStatus::Cancelled;
        invoice.cancelled_at = Some(now);
        invoice.cancellation_reason = Some(reason.to_string());
        invoice.cancelled_by = Some(actor.id);
        invoice.cancelled_by_name = Some(actor.display_name.clone());
        Self::touch(&mut invoice, actor, now);

        let saved = self
            .save(&invoice, loaded, Self::ensure_cancellable)
            .await?;

        INVOICE_EVENTS_TOTAL.with_label_values(&["cancelled"]).inc();
        info!(number = %saved.number, reason = %reason, "Invoice cancelled");
        Ok(saved)
    }

    /// Copy an invoice of any status into a new active invoice.
    #[instrument(skip(self, actor), fields(tenant_id = %actor.tenant_id, user_id = %actor.id, invoice_id = %invoice_id))]
    pub async fn duplicate(
        &self,
        actor: &User,
        invoice_id: Uuid,
        new_id: Option<Uuid>,
    ) -> Result<Invoice, InvoiceError> {
        Self::authorize(actor, InvoiceAction::Duplicate, None)?;

        if let Some(id) = new_id {
            if let Some(existing) = self.find(actor.tenant_id, id).await? {
                info!(duplicate_id = %id, "Duplicate already exists, no-op");
                return Ok(existing);
            }
        }

        let source = self.load(actor.tenant_id, invoice_id).await?;

        let inputs: Vec<LineItemInput> = source.items.iter().map(LineItemInput::from).collect();
        let mut errors = ValidationErrors::new();
        let (items, totals) =
            compute_totals(&inputs, source.discount.as_ref(), source.tax, &mut errors)
                .ok_or(InvoiceError::Validation(errors))?;

        let number = self
            .numbering
            .next_number(actor.tenant_id)
            .await
            .map_err(InvoiceError::Dependency)?;

        let back_reference = format!("Duplicata de {}", source.number);
        let notes = match non_empty(&source.notes) {
            Some(notes) => format!("{}\n{}", back_reference, notes),
            None => back_reference,
        };

        let now = Utc::now();
        let copy = Invoice {
            id: new_id.unwrap_or_else(Uuid::new_v4),
            number,
            items,
            subtotal: totals.subtotal,
            discount_amount: totals.discount_amount,
            total: totals.total,
            status: InvoiceStatus::Active,
            paid: false,
            withdrawn: false,
            payment_method: None,
            deposit_date: now,
            estimated_ready_date: None,
            payment_date: None,
            withdrawal_date: None,
            cancelled_at: None,
            cancellation_reason: None,
            cancelled_by: None,
            cancelled_by_name: None,
            created_at: now,
            created_by: actor.id,
            created_by_name: actor.display_name.clone(),
            modified_at: None,
            modified_by: None,
            modified_by_name: None,
            notes: Some(notes),
            source_invoice_id: Some(source.id),
            ..source
        };

        let stored = self
            .store
            .insert_invoice(&copy)
            .await
            .map_err(InvoiceError::Store)?;

        INVOICE_EVENTS_TOTAL.with_label_values(&["duplicated"]).inc();
        info!(number = %stored.number, source_invoice_id = %invoice_id, "Invoice duplicated");

        self.record_client_activity(&stored, ClientActivity::Visit);
        Ok(stored)
    }

    /// Merge a partial update. Totals are recomputed whenever items,
    /// discount or tax are part of the update.
    #[instrument(skip(self, actor, patch), fields(tenant_id = %actor.tenant_id, user_id = %actor.id, invoice_id = %invoice_id))]
    pub async fn update(
        &self,
        actor: &User,
        invoice_id: Uuid,
        patch: UpdateInvoiceInput,
    ) -> Result<Invoice, InvoiceError> {
        let mut errors = patch.validate().err().unwrap_or_else(ValidationErrors::new);
        if patch.client_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            blank_client_name(&mut errors, "Client name cannot be empty");
        }
        if !errors.errors().is_empty() {
            return Err(InvoiceError::Validation(errors));
        }

        let mut invoice = self.load(actor.tenant_id, invoice_id).await?;
        Self::authorize(actor, InvoiceAction::Update, Some(&invoice))?;

        // Owners may still edit a cancelled invoice's metadata, never its amounts.
        let owner = actor.is_owner();
        let financial = patch.touches_financials();
        let ensure_modifiable = move |current: &Invoice| {
            if current.is_cancelled() && (!owner || financial) {
                Err(InvoiceError::NotModifiable)
            } else {
                Ok(())
            }
        };
        ensure_modifiable(&invoice)?;
        let loaded = invoice.lifecycle();

        if patch.touches_financials() {
            let items: Vec<LineItemInput> = match &patch.items {
                Some(items) => items.clone(),
                None => invoice.items.iter().map(LineItemInput::from).collect(),
            };
            let discount = patch.discount.or(invoice.discount);
            let tax = patch.tax.or(invoice.tax);

            let mut errors = ValidationErrors::new();
            let (priced, totals) = compute_totals(&items, discount.as_ref(), tax, &mut errors)
                .ok_or(InvoiceError::Validation(errors))?;
            invoice.apply_totals(priced, totals);
            invoice.discount = discount;
            invoice.tax = tax;
        }

        patch.merge_metadata(&mut invoice);
        Self::touch(&mut invoice, actor, Utc::now());

        let saved = self.save(&invoice, loaded, ensure_modifiable).await?;

        INVOICE_EVENTS_TOTAL.with_label_values(&["updated"]).inc();
        info!(number = %saved.number, "Invoice updated");
        Ok(saved)
    }

    /// Owner-only soft delete: cancels with a fixed reason.
    #[instrument(skip(self, actor), fields(tenant_id = %actor.tenant_id, user_id = %actor.id, invoice_id = %invoice_id))]
    pub async fn delete(&self, actor: &User, invoice_id: Uuid) -> Result<Invoice, InvoiceError> {
        Self::authorize(actor, InvoiceAction::Delete, None)?;
        self.cancel(actor, invoice_id, DELETE_REASON).await
    }
}
