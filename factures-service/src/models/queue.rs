//! Offline queue models.

use super::invoice::{CreateInvoiceInput, PayInput, UpdateInvoiceInput};
use super::user::User;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Entries are discarded once this many replays have failed.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// Resources an offline mutation may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Invoices,
    Articles,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Invoices => "invoices",
            Resource::Articles => "articles",
        }
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoices" => Ok(Resource::Invoices),
            "articles" => Ok(Resource::Articles),
            _ => Err(format!("Unknown resource: {}", s)),
        }
    }
}

/// A mutation recorded while the data store was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueueEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub kind: OperationKind,
    pub resource: Resource,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl OfflineQueueEntry {
    pub fn new(user: &User, kind: OperationKind, resource: Resource, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user.id,
            tenant_id: user.tenant_id,
            kind,
            resource,
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }

    /// Record a failed attempt. Returns true once the entry is exhausted.
    pub fn record_failure(&mut self, error: String) -> bool {
        self.retry_count += 1;
        self.last_error = Some(error);
        self.retry_count >= MAX_RETRIES
    }
}

/// Invoice transition carried by a queued `update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InvoiceChange {
    Pay(PayInput),
    Withdraw {
        #[serde(default)]
        date: Option<DateTime<Utc>>,
    },
    Cancel {
        #[serde(default)]
        reason: String,
    },
    Duplicate {
        #[serde(default, rename = "newId")]
        new_id: Option<Uuid>,
    },
    Update(UpdateInvoiceInput),
}

impl InvoiceChange {
    pub fn name(&self) -> &'static str {
        match self {
            InvoiceChange::Pay(_) => "pay",
            InvoiceChange::Withdraw { .. } => "withdraw",
            InvoiceChange::Cancel { .. } => "cancel",
            InvoiceChange::Duplicate { .. } => "duplicate",
            InvoiceChange::Update(_) => "update",
        }
    }
}

/// Payload of a queued invoice `update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceUpdatePayload {
    pub id: Uuid,
    pub change: InvoiceChange,
}

/// Payload of a queued `delete`, and the key of any queued `update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetId {
    pub id: Uuid,
}

/// Payload of a queued invoice `create`; always carries the client id.
pub type InvoiceCreatePayload = CreateInvoiceInput;

/// Outcome of one replay pass for a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub applied: usize,
    pub failed: usize,
    pub dropped: usize,
    pub pending: usize,
    /// Another replay for the same user was already running.
    pub skipped: bool,
    /// The store went away mid-pass; remaining entries were left untouched.
    pub interrupted: bool,
}
