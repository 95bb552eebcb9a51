//! Search and listing queries.

use super::invoice::{Invoice, InvoiceStatus, Urgency};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;
/// Highest page whose offset still fits in an `i64` at any page size.
pub const MAX_PAGE: i64 = i64::MAX / MAX_PAGE_SIZE;

/// Marker that turns a search term into a lookup of the tag after it.
pub const TAG_MARKER: char = '#';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Relevance,
    Date,
    Amount,
    Client,
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relevance" => Ok(SortField::Relevance),
            "date" => Ok(SortField::Date),
            "amount" => Ok(SortField::Amount),
            "client" => Ok(SortField::Client),
            _ => Err(format!("Invalid sort field: {}", s)),
        }
    }
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Relevance => "relevance",
            SortField::Date => "date",
            SortField::Amount => "amount",
            SortField::Client => "client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(format!("Invalid sort order: {}", s)),
        }
    }
}

/// Optional candidate filters. All present filters must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceFilters {
    #[serde(default)]
    pub status: Option<InvoiceStatus>,
    #[serde(default)]
    pub paid: Option<bool>,
    #[serde(default)]
    pub withdrawn: Option<bool>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
}

impl InvoiceFilters {
    pub fn matches(&self, invoice: &Invoice) -> bool {
        self.status.map_or(true, |s| invoice.status == s)
            && self.paid.map_or(true, |p| invoice.paid == p)
            && self.withdrawn.map_or(true, |w| invoice.withdrawn == w)
            && self.urgency.map_or(true, |u| invoice.urgency == u)
            && self.date_from.map_or(true, |d| invoice.deposit_date >= d)
            && self.date_to.map_or(true, |d| invoice.deposit_date <= d)
            && self.min_amount.map_or(true, |a| invoice.total >= a)
            && self.max_amount.map_or(true, |a| invoice.total <= a)
            && self.created_by.map_or(true, |u| invoice.created_by == u)
    }
}

/// A parsed free-text search term.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchTerm {
    /// Broad match across number, client fields and notes.
    Text { needle: String, amount: Option<Decimal> },
    /// Containment match against the tag set.
    Tag(String),
}

impl SearchTerm {
    /// Parse a raw term. Blank terms yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some((_, tag)) = trimmed.split_once(TAG_MARKER) {
            let tag = tag.trim().to_lowercase();
            return (!tag.is_empty()).then_some(SearchTerm::Tag(tag));
        }
        Some(SearchTerm::Text {
            needle: trimmed.to_lowercase(),
            amount: Decimal::from_str(trimmed).ok(),
        })
    }

    /// The lowercase text used for substring matching.
    pub fn needle(&self) -> &str {
        match self {
            SearchTerm::Text { needle, .. } => needle,
            SearchTerm::Tag(tag) => tag,
        }
    }

    /// Candidate retrieval predicate, mirrored by the SQL adapter.
    pub fn matches(&self, invoice: &Invoice) -> bool {
        match self {
            SearchTerm::Tag(tag) => invoice.tags.iter().any(|t| t.to_lowercase().contains(tag)),
            SearchTerm::Text { needle, amount } => {
                let contains = |value: &str| value.to_lowercase().contains(needle.as_str());
                contains(&invoice.number)
                    || contains(&invoice.client_name)
                    || invoice.client_phone.as_deref().is_some_and(contains)
                    || invoice.client_email.as_deref().is_some_and(contains)
                    || invoice.notes.as_deref().is_some_and(contains)
                    || amount.is_some_and(|a| invoice.total == a || invoice.subtotal == a)
            }
        }
    }
}

/// Page window applied by the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: i64,
    pub limit: i64,
}

/// Query handed to the data store.
///
/// `window = None` fetches every candidate; `SortField::Relevance` is
/// retrieved newest first and ranked by the caller.
#[derive(Debug, Clone)]
pub struct InvoiceQuery {
    pub term: Option<SearchTerm>,
    pub filters: InvoiceFilters,
    pub sort: SortField,
    pub order: SortOrder,
    pub window: Option<Window>,
}

/// One page of store results plus the unpaginated count.
#[derive(Debug, Clone, Default)]
pub struct InvoicePage {
    pub invoices: Vec<Invoice>,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        let total_pages = if total == 0 {
            0
        } else {
            (total + limit - 1) / limit
        };
        Self {
            page,
            limit,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

/// Normalize requested page and limit: page within 1..=MAX_PAGE, limit
/// within 1..=100.
pub fn clamp_page(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    let page = page.unwrap_or(1).clamp(1, MAX_PAGE);
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (page, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_stats() {
        let p = Pagination::new(2, 10, 25);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next);
        assert!(p.has_prev);

        let empty = Pagination::new(1, 10, 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);
        assert!(!empty.has_prev);
    }

    #[test]
    fn clamps_page_and_limit() {
        assert_eq!(clamp_page(None, None), (1, DEFAULT_PAGE_SIZE));
        assert_eq!(clamp_page(Some(0), Some(1000)), (1, MAX_PAGE_SIZE));
        assert_eq!(clamp_page(Some(3), Some(0)), (3, 1));

        let (page, limit) = clamp_page(Some(i64::MAX), Some(MAX_PAGE_SIZE));
        assert_eq!(page, MAX_PAGE);
        assert!((page - 1).checked_mul(limit).is_some());
    }

    #[test]
    fn parses_terms() {
        assert_eq!(SearchTerm::parse("   "), None);
        assert_eq!(SearchTerm::parse("#VIP"), Some(SearchTerm::Tag("vip".into())));
        assert_eq!(
            SearchTerm::parse("client #VIP"),
            Some(SearchTerm::Tag("vip".into()))
        );
        assert_eq!(SearchTerm::parse("rush#"), None);
        assert_eq!(
            SearchTerm::parse("4500"),
            Some(SearchTerm::Text {
                needle: "4500".into(),
                amount: Some(Decimal::from(4500)),
            })
        );
    }
}
