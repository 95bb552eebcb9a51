//! Relevance-ranked invoice search.

use crate::models::{
    clamp_page, Invoice, InvoiceFilters, InvoiceQuery, InvoiceStatus, Pagination, SearchTerm,
    SortField, SortOrder, Window,
};
use crate::services::metrics::SEARCH_DURATION;
use crate::services::store::DataStore;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Score contributions. Text fields score `exact` on a full match and
/// `partial` on a substring match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreWeights {
    pub number: (i64, i64),
    pub client_name: (i64, i64),
    pub phone: (i64, i64),
    pub email: (i64, i64),
    pub notes: i64,
    pub tags: i64,
    pub last_week: i64,
    pub last_month: i64,
    pub active: i64,
    pub unpaid: i64,
    pub awaiting_pickup: i64,
}

pub const WEIGHTS: ScoreWeights = ScoreWeights {
    number: (100, 50),
    client_name: (80, 30),
    phone: (90, 40),
    email: (70, 25),
    notes: 20,
    tags: 35,
    last_week: 10,
    last_month: 5,
    active: 10,
    unpaid: 15,
    awaiting_pickup: 10,
};

fn text_score(value: Option<&str>, needle: &str, (exact, partial): (i64, i64)) -> i64 {
    match value.map(str::to_lowercase) {
        Some(v) if v == needle => exact,
        Some(v) if v.contains(needle) => partial,
        _ => 0,
    }
}

/// Deterministic relevance score of `invoice` for `term` as of `now`.
pub fn score(invoice: &Invoice, term: &SearchTerm, now: DateTime<Utc>) -> i64 {
    score_with(&WEIGHTS, invoice, term, now)
}

pub fn score_with(
    weights: &ScoreWeights,
    invoice: &Invoice,
    term: &SearchTerm,
    now: DateTime<Utc>,
) -> i64 {
    let needle = term.needle();
    let mut total = 0;

    total += text_score(Some(&invoice.number), needle, weights.number);
    total += text_score(Some(&invoice.client_name), needle, weights.client_name);
    total += text_score(invoice.client_phone.as_deref(), needle, weights.phone);
    total += text_score(invoice.client_email.as_deref(), needle, weights.email);

    if invoice
        .notes
        .as_deref()
        .is_some_and(|n| n.to_lowercase().contains(needle))
    {
        total += weights.notes;
    }
    if invoice
        .tags
        .iter()
        .any(|t| t.to_lowercase().contains(needle))
    {
        total += weights.tags;
    }

    let age = now - invoice.created_at;
    if age <= Duration::days(7) {
        total += weights.last_week;
    } else if age <= Duration::days(30) {
        total += weights.last_month;
    }

    if invoice.status == InvoiceStatus::Active {
        total += weights.active;
    }
    if !invoice.paid {
        total += weights.unpaid;
    } else if !invoice.withdrawn {
        total += weights.awaiting_pickup;
    }

    total
}

/// Rank candidates by score. The sort is stable, so ties keep retrieval order.
pub fn rank(
    candidates: Vec<Invoice>,
    term: &SearchTerm,
    order: SortOrder,
    now: DateTime<Utc>,
) -> Vec<ScoredInvoice> {
    let mut scored: Vec<ScoredInvoice> = candidates
        .into_iter()
        .map(|invoice| ScoredInvoice {
            score: score(&invoice, term, now),
            invoice,
        })
        .collect();

    match order {
        SortOrder::Desc => scored.sort_by(|a, b| b.score.cmp(&a.score)),
        SortOrder::Asc => scored.sort_by(|a, b| a.score.cmp(&b.score)),
    }
    scored
}

#[derive(Debug, Clone)]
pub struct ScoredInvoice {
    pub invoice: Invoice,
    pub score: i64,
}

/// A search request after parsing.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub term: Option<String>,
    pub filters: InvoiceFilters,
    pub sort: Option<SortField>,
    pub order: Option<SortOrder>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub invoice: Invoice,
    /// Present only in relevance mode.
    pub score: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub pagination: Pagination,
    pub sort: SortField,
}

#[derive(Clone)]
pub struct SearchService {
    store: Arc<dyn DataStore>,
}

impl SearchService {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Run a search for `tenant_id`.
    ///
    /// Relevance mode (the default when a term is given) scores every
    /// candidate before slicing the page. Other modes page in the store.
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id))]
    pub async fn search(
        &self,
        tenant_id: Uuid,
        request: SearchRequest,
    ) -> Result<SearchResults, AppError> {
        let term = request.term.as_deref().and_then(SearchTerm::parse);
        let sort = match (request.sort, &term) {
            // Nothing to rank against without a term.
            (Some(SortField::Relevance), None) | (None, None) => SortField::Date,
            (Some(sort), _) => sort,
            (None, Some(_)) => SortField::Relevance,
        };
        let order = request.order.unwrap_or(SortOrder::Desc);
        let (page, limit) = clamp_page(request.page, request.limit);
        let offset = (page - 1) * limit;

        let timer = SEARCH_DURATION
            .with_label_values(&[sort.as_str()])
            .start_timer();

        let results = match (sort, term) {
            (SortField::Relevance, Some(term)) => {
                let query = InvoiceQuery {
                    term: Some(term.clone()),
                    filters: request.filters,
                    sort,
                    order,
                    window: None,
                };
                let candidates = self.store.query_invoices(tenant_id, &query).await?;
                let total = candidates.invoices.len() as i64;
                let hits = rank(candidates.invoices, &term, order, Utc::now())
                    .into_iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .map(|scored| SearchHit {
                        invoice: scored.invoice,
                        score: Some(scored.score),
                    })
                    .collect();
                SearchResults {
                    hits,
                    pagination: Pagination::new(page, limit, total),
                    sort,
                }
            }
            (sort, term) => {
                let query = InvoiceQuery {
                    term,
                    filters: request.filters,
                    sort,
                    order,
                    window: Some(Window { offset, limit }),
                };
                let page_result = self.store.query_invoices(tenant_id, &query).await?;
                SearchResults {
                    hits: page_result
                        .invoices
                        .into_iter()
                        .map(|invoice| SearchHit {
                            invoice,
                            score: None,
                        })
                        .collect(),
                    pagination: Pagination::new(page, limit, page_result.total),
                    sort,
                }
            }
        };

        timer.observe_duration();
        debug!(
            sort = sort.as_str(),
            total = results.pagination.total,
            "Search completed"
        );

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Urgency;
    use rust_decimal::Decimal;

    fn invoice(number: &str, client: &str, created_at: DateTime<Utc>) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            number: number.into(),
            client_name: client.into(),
            client_phone: None,
            client_email: None,
            client_address: None,
            items: vec![],
            subtotal: Decimal::ZERO,
            discount: None,
            discount_amount: Decimal::ZERO,
            tax: None,
            total: Decimal::ZERO,
            status: InvoiceStatus::Active,
            paid: false,
            withdrawn: false,
            payment_method: None,
            deposit_date: created_at,
            estimated_ready_date: None,
            payment_date: None,
            withdrawal_date: None,
            cancelled_at: None,
            cancellation_reason: None,
            cancelled_by: None,
            cancelled_by_name: None,
            created_at,
            created_by: Uuid::nil(),
            created_by_name: "Owner".into(),
            modified_at: None,
            modified_by: None,
            modified_by_name: None,
            urgency: Urgency::Normal,
            tags: vec![],
            notes: None,
            source_invoice_id: None,
        }
    }

    fn text(raw: &str) -> SearchTerm {
        SearchTerm::parse(raw).expect("non-blank term")
    }

    #[test]
    fn exact_number_scores_every_field_rule() {
        let now = Utc::now();
        let inv = invoice("FAC-000042", "Awa Diop", now);
        // exact number + recent + active + unpaid
        assert_eq!(score(&inv, &text("fac-000042"), now), 100 + 10 + 10 + 15);
    }

    #[test]
    fn partial_matches_accumulate() {
        let now = Utc::now();
        let mut inv = invoice("FAC-000001", "Marie Dupont", now - Duration::days(20));
        inv.notes = Some("Chemise dupont, tache".into());
        inv.tags = vec!["dupont-famille".into()];
        inv.paid = true;
        // name partial 30 + notes 20 + tags 35 + month 5 + active 10 + awaiting pickup 10
        assert_eq!(score(&inv, &text("dupont"), now), 30 + 20 + 35 + 5 + 10 + 10);
    }

    #[test]
    fn old_cancelled_withdrawn_invoices_get_no_bonus() {
        let now = Utc::now();
        let mut inv = invoice("FAC-000009", "Jean", now - Duration::days(90));
        inv.status = InvoiceStatus::Cancelled;
        inv.paid = true;
        inv.withdrawn = true;
        assert_eq!(score(&inv, &text("zzz"), now), 0);
    }

    #[test]
    fn ranking_is_stable_for_ties() {
        let now = Utc::now();
        let a = invoice("FAC-000010", "Client A", now);
        let b = invoice("FAC-000011", "Client B", now);
        let c = invoice("FAC-000012", "Client C", now);
        let ids = [a.id, b.id, c.id];

        let ranked = rank(vec![a, b, c], &text("client"), SortOrder::Desc, now);
        let ranked_ids: Vec<Uuid> = ranked.iter().map(|s| s.invoice.id).collect();
        assert_eq!(ranked_ids, ids);
    }

    #[test]
    fn ascending_order_reverses_ranking() {
        let now = Utc::now();
        let strong = invoice("FAC-000100", "Fatou", now);
        let weak = invoice("FAC-000200", "Fatou Sall", now - Duration::days(60));
        let ranked = rank(
            vec![strong.clone(), weak.clone()],
            &text("fatou"),
            SortOrder::Asc,
            now,
        );
        assert_eq!(ranked[0].invoice.id, weak.id);
        assert_eq!(ranked[1].invoice.id, strong.id);
    }
}
