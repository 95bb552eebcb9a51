//! Data store seams.
//!
//! `DataStore` is the tenant-scoped record store, `InvoiceNumbering` allocates
//! invoice numbers and `ClientStats` keeps per-client aggregates. Each has a
//! PostgreSQL adapter and an in-memory adapter.

use crate::models::{
    Invoice, InvoicePage, InvoiceQuery, InvoiceStatus, LifecycleState, OperationKind, Resource,
    User,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Succeeds when the store is reachable.
    async fn health_check(&self) -> Result<(), AppError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError>;

    /// Insert a new invoice. Fails with `Conflict` if the id is taken.
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError>;

    async fn get_invoice(&self, tenant_id: Uuid, invoice_id: Uuid)
        -> Result<Option<Invoice>, AppError>;

    /// Persist changes to an existing invoice, provided its stored lifecycle
    /// still equals `expected`. Fails with `Conflict` otherwise.
    ///
    /// The number is never rewritten and the lifecycle flags only move
    /// forward: see [`merge_lifecycle`].
    async fn save_invoice(
        &self,
        invoice: &Invoice,
        expected: LifecycleState,
    ) -> Result<Invoice, AppError>;

    async fn query_invoices(
        &self,
        tenant_id: Uuid,
        query: &InvoiceQuery,
    ) -> Result<InvoicePage, AppError>;

    /// Apply a generic mutation keyed by the payload's `id`.
    ///
    /// Inserts are no-ops when the id already exists.
    async fn apply_mutation(
        &self,
        tenant_id: Uuid,
        resource: Resource,
        kind: OperationKind,
        payload: &Value,
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait InvoiceNumbering: Send + Sync {
    /// Allocate the next number for the tenant. Numbers are never reused.
    async fn next_number(&self, tenant_id: Uuid) -> Result<String, AppError>;
}

/// What happened for a client, for aggregate statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientActivity {
    /// An invoice was opened for the client.
    Visit,
    /// The client paid this amount.
    Payment(Decimal),
}

#[async_trait]
pub trait ClientStats: Send + Sync {
    async fn record_activity(
        &self,
        tenant_id: Uuid,
        phone: &str,
        name: &str,
        activity: ClientActivity,
    ) -> Result<(), AppError>;
}

pub fn format_number(sequence: i64) -> String {
    format!("FAC-{:06}", sequence)
}

/// Carry forward the monotonic parts of `stored` into `incoming`.
///
/// `paid` and `withdrawn` never revert, a cancelled invoice stays cancelled
/// with its original cancellation record, and the number never changes.
pub fn merge_lifecycle(stored: &Invoice, incoming: &mut Invoice) {
    incoming.number = stored.number.clone();
    incoming.paid |= stored.paid;
    incoming.withdrawn |= stored.withdrawn;
    if stored.payment_method.is_some() && stored.paid {
        incoming.payment_method = stored.payment_method;
        incoming.payment_date = stored.payment_date;
    }
    if stored.withdrawn {
        incoming.withdrawal_date = stored.withdrawal_date;
    }
    if stored.status == InvoiceStatus::Cancelled {
        incoming.status = InvoiceStatus::Cancelled;
        incoming.cancelled_at = stored.cancelled_at;
        incoming.cancellation_reason = stored.cancellation_reason.clone();
        incoming.cancelled_by = stored.cancelled_by;
        incoming.cancelled_by_name = stored.cancelled_by_name.clone();
    }
    incoming.created_at = stored.created_at;
    incoming.created_by = stored.created_by;
    incoming.created_by_name = stored.created_by_name.clone();
}
