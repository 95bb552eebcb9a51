//! In-memory data store for development and tests.

use crate::models::{
    Invoice, InvoicePage, InvoiceQuery, LifecycleState, OperationKind, Resource, SortField,
    SortOrder, User,
};
use crate::services::store::{
    format_number, merge_lifecycle, ClientActivity, ClientStats, DataStore, InvoiceNumbering,
};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::Value;
use service_core::error::AppError;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Aggregates kept per client phone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientTotals {
    pub name: String,
    pub visit_count: i64,
    pub total_spent: Decimal,
}

/// DashMap-backed store. Can simulate an unreachable store and failing
/// collaborators.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    invoices: DashMap<(Uuid, Uuid), Invoice>,
    articles: DashMap<(Uuid, Uuid), Value>,
    counters: DashMap<Uuid, i64>,
    clients: DashMap<(Uuid, String), ClientTotals>,
    offline: AtomicBool,
    numbering_down: AtomicBool,
    stats_down: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Toggle simulated reachability of the whole store.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, AtomicOrdering::SeqCst);
    }

    pub fn set_numbering_available(&self, available: bool) {
        self.numbering_down.store(!available, AtomicOrdering::SeqCst);
    }

    pub fn set_stats_available(&self, available: bool) {
        self.stats_down.store(!available, AtomicOrdering::SeqCst);
    }

    pub fn client_totals(&self, tenant_id: Uuid, phone: &str) -> Option<ClientTotals> {
        self.clients
            .get(&(tenant_id, phone.to_string()))
            .map(|entry| entry.clone())
    }

    pub fn article(&self, tenant_id: Uuid, article_id: Uuid) -> Option<Value> {
        self.articles
            .get(&(tenant_id, article_id))
            .map(|entry| entry.clone())
    }

    pub fn invoice_count(&self, tenant_id: Uuid) -> usize {
        self.invoices
            .iter()
            .filter(|entry| entry.key().0 == tenant_id)
            .count()
    }

    fn ensure_available(&self) -> Result<(), AppError> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            return Err(AppError::ServiceUnavailable);
        }
        Ok(())
    }
}

fn compare(a: &Invoice, b: &Invoice, sort: SortField, order: SortOrder) -> Ordering {
    let newest_first = b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id));
    let primary = match sort {
        // Relevance candidates come back newest first; ranking happens later.
        SortField::Relevance => return newest_first,
        SortField::Date => a.created_at.cmp(&b.created_at),
        SortField::Amount => a.total.cmp(&b.total),
        SortField::Client => a
            .client_name
            .to_lowercase()
            .cmp(&b.client_name.to_lowercase()),
    };
    let primary = match order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };
    primary.then(newest_first)
}

fn payload_id(payload: &Value) -> Result<Uuid, AppError> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Payload has no valid id")))
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.ensure_available()
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        self.ensure_available()?;
        Ok(self.users.get(&user_id).map(|entry| entry.clone()))
    }

    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.id))]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        self.ensure_available()?;
        let key = (invoice.tenant_id, invoice.id);
        match self.invoices.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AppError::Conflict(
                anyhow::anyhow!("Invoice {} already exists", invoice.id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(invoice.clone());
                debug!("Invoice stored");
                Ok(invoice.clone())
            }
        }
    }

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        self.ensure_available()?;
        Ok(self
            .invoices
            .get(&(tenant_id, invoice_id))
            .map(|entry| entry.clone()))
    }

    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.id))]
    async fn save_invoice(
        &self,
        invoice: &Invoice,
        expected: LifecycleState,
    ) -> Result<Invoice, AppError> {
        self.ensure_available()?;
        let mut entry = self
            .invoices
            .get_mut(&(invoice.tenant_id, invoice.id))
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        if entry.lifecycle() != expected {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice was modified concurrently"
            )));
        }
        let mut next = invoice.clone();
        merge_lifecycle(entry.value(), &mut next);
        *entry = next.clone();
        Ok(next)
    }

    async fn query_invoices(
        &self,
        tenant_id: Uuid,
        query: &InvoiceQuery,
    ) -> Result<InvoicePage, AppError> {
        self.ensure_available()?;
        let mut matched: Vec<Invoice> = self
            .invoices
            .iter()
            .filter(|entry| entry.key().0 == tenant_id)
            .map(|entry| entry.value().clone())
            .filter(|invoice| query.filters.matches(invoice))
            .filter(|invoice| query.term.as_ref().map_or(true, |t| t.matches(invoice)))
            .collect();

        matched.sort_by(|a, b| compare(a, b, query.sort, query.order));
        let total = matched.len() as i64;

        let invoices = match query.window {
            Some(window) => matched
                .into_iter()
                .skip(window.offset.max(0) as usize)
                .take(window.limit.max(0) as usize)
                .collect(),
            None => matched,
        };

        Ok(InvoicePage { invoices, total })
    }

    async fn apply_mutation(
        &self,
        tenant_id: Uuid,
        resource: Resource,
        kind: OperationKind,
        payload: &Value,
    ) -> Result<(), AppError> {
        self.ensure_available()?;
        if resource != Resource::Articles {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Resource {} is not a generic resource",
                resource.as_str()
            )));
        }

        let id = payload_id(payload)?;
        let key = (tenant_id, id);
        match kind {
            OperationKind::Create => {
                self.articles.entry(key).or_insert_with(|| payload.clone());
            }
            OperationKind::Update => {
                let mut current = self
                    .articles
                    .get_mut(&key)
                    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Article {} not found", id)))?;
                if let (Some(target), Some(changes)) = (current.as_object_mut(), payload.as_object())
                {
                    for (field, value) in changes {
                        target.insert(field.clone(), value.clone());
                    }
                }
            }
            OperationKind::Delete => {
                self.articles.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InvoiceNumbering for MemoryStore {
    async fn next_number(&self, tenant_id: Uuid) -> Result<String, AppError> {
        self.ensure_available()?;
        if self.numbering_down.load(AtomicOrdering::SeqCst) {
            return Err(AppError::DependencyError(anyhow::anyhow!(
                "Numbering service unavailable"
            )));
        }
        let mut counter = self.counters.entry(tenant_id).or_insert(0);
        *counter += 1;
        Ok(format_number(*counter))
    }
}

#[async_trait]
impl ClientStats for MemoryStore {
    async fn record_activity(
        &self,
        tenant_id: Uuid,
        phone: &str,
        name: &str,
        activity: ClientActivity,
    ) -> Result<(), AppError> {
        self.ensure_available()?;
        if self.stats_down.load(AtomicOrdering::SeqCst) {
            return Err(AppError::DependencyError(anyhow::anyhow!(
                "Client statistics unavailable"
            )));
        }
        let mut totals = self
            .clients
            .entry((tenant_id, phone.to_string()))
            .or_default();
        totals.name = name.to_string();
        match activity {
            ClientActivity::Visit => totals.visit_count += 1,
            ClientActivity::Payment(amount) => totals.total_spent += amount,
        }
        Ok(())
    }
}
