use crate::models::{Invoice, InvoiceStats, UpdateInvoiceInput};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use uuid::Uuid;

/// Decode a JSON body, reporting shape errors as 400.
pub fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T, AppError> {
    Ok(serde_json::from_value(body)?)
}

/// `PUT /invoices` body: the target id next to the changed fields.
#[derive(Debug, Deserialize)]
pub struct UpdateInvoiceRequest {
    pub id: Uuid,
    #[serde(flatten)]
    pub patch: UpdateInvoiceInput,
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub id: Option<Uuid>,
}

/// A single invoice with its derived figures.
#[derive(Debug, Serialize)]
pub struct InvoiceDetail {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub stats: InvoiceStats,
}

/// Answer to a mutation accepted while the data store is unreachable.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedResponse {
    pub queued: bool,
    pub entry_id: Uuid,
    pub pending: usize,
}
