//! Line item model for factures-service.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Line item on an invoice. `total` is always `quantity * unit_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub article_id: Uuid,
    pub label: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total: Decimal,
}

/// Line item as submitted by a caller; the total is derived, never trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemInput {
    pub article_id: Uuid,
    #[serde(default)]
    pub label: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl LineItemInput {
    /// `None` when the line total does not fit in a `Decimal`.
    pub fn priced(&self) -> Option<LineItem> {
        let total = Decimal::from(self.quantity).checked_mul(self.unit_price)?;
        Some(LineItem {
            article_id: self.article_id,
            label: self.label.clone(),
            quantity: self.quantity,
            unit_price: self.unit_price,
            total,
        })
    }
}

impl From<&LineItem> for LineItemInput {
    fn from(item: &LineItem) -> Self {
        Self {
            article_id: item.article_id,
            label: item.label.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
        }
    }
}
