use crate::models::{Invoice, InvoiceFilters, InvoiceStatus, SortField, SortOrder, Urgency};
use crate::services::search::{SearchHit, SearchRequest};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `POST /invoices/search` body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchBody {
    #[serde(default, alias = "q")]
    pub term: Option<String>,
    #[serde(default)]
    pub filters: InvoiceFilters,
    #[serde(default)]
    pub sort: Option<SortField>,
    #[serde(default)]
    pub order: Option<SortOrder>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl From<SearchBody> for SearchRequest {
    fn from(body: SearchBody) -> Self {
        SearchRequest {
            term: body.term,
            filters: body.filters,
            sort: body.sort,
            order: body.order,
            page: body.page,
            limit: body.limit,
        }
    }
}

/// Query string of `GET /invoices` and `GET /invoices/search`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub q: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub paid: Option<bool>,
    pub withdrawn: Option<bool>,
    pub urgency: Option<Urgency>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub created_by: Option<Uuid>,
    pub sort: Option<SortField>,
    pub order: Option<SortOrder>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl From<SearchParams> for SearchRequest {
    fn from(params: SearchParams) -> Self {
        SearchRequest {
            term: params.q,
            filters: InvoiceFilters {
                status: params.status,
                paid: params.paid,
                withdrawn: params.withdrawn,
                urgency: params.urgency,
                date_from: params.date_from,
                date_to: params.date_to,
                min_amount: params.min_amount,
                max_amount: params.max_amount,
                created_by: params.created_by,
            },
            sort: params.sort,
            order: params.order,
            page: params.page,
            limit: params.limit,
        }
    }
}

/// One search result row; `score` only appears in relevance mode.
#[derive(Debug, Serialize)]
pub struct SearchHitResponse {
    #[serde(flatten)]
    pub invoice: Invoice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
}

impl From<SearchHit> for SearchHitResponse {
    fn from(hit: SearchHit) -> Self {
        Self {
            invoice: hit.invoice,
            score: hit.score,
        }
    }
}
