//! Invoice model for factures-service.

use super::line_item::{LineItem, LineItemInput};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::field_error;
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

/// Invoice status. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Active,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Active => "active",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(InvoiceStatus::Active),
            "cancelled" => Ok(InvoiceStatus::Cancelled),
            _ => Err(format!("Invalid invoice status: {}", s)),
        }
    }
}

/// Handling priority requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Normal,
    Express,
    Urgent,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Normal => "normal",
            Urgency::Express => "express",
            Urgency::Urgent => "urgent",
        }
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Urgency::Normal),
            "express" => Ok(Urgency::Express),
            "urgent" => Ok(Urgency::Urgent),
            _ => Err(format!("Invalid urgency: {}", s)),
        }
    }
}

/// Accepted payment methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Check,
    Transfer,
    MobileMoney,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Check => "check",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::MobileMoney => "mobile_money",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "check" => Ok(PaymentMethod::Check),
            "transfer" => Ok(PaymentMethod::Transfer),
            "mobile_money" => Ok(PaymentMethod::MobileMoney),
            _ => Err(format!("Invalid payment method: {}", s)),
        }
    }
}

/// Discount, either a fixed amount or a percentage of the subtotal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discount {
    Amount(Decimal),
    Percentage(Decimal),
}

impl Discount {
    /// Resolve to a monetary amount for the given subtotal.
    pub fn amount_for(&self, subtotal: Decimal) -> Option<Decimal> {
        match self {
            Discount::Amount(amount) => Some(*amount),
            Discount::Percentage(pct) => subtotal
                .checked_mul(*pct)?
                .checked_div(Decimal::ONE_HUNDRED)
                .map(|amount| amount.round_dp(2)),
        }
    }
}

/// Derived financial figures of an invoice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// Price the line items and derive `total = subtotal - discount + tax`.
///
/// Every validation problem is collected into `errors` so callers can report
/// them all at once; `None` is returned when any were found.
pub fn compute_totals(
    items: &[LineItemInput],
    discount: Option<&Discount>,
    tax: Option<Decimal>,
    errors: &mut ValidationErrors,
) -> Option<(Vec<LineItem>, Totals)> {
    let mut invalid = false;

    if items.is_empty() {
        if !errors.errors().contains_key("items") {
            errors.add(
                "items",
                field_error("length", "At least one line item is required"),
            );
        }
        invalid = true;
    }
    if items.iter().any(|item| item.quantity < 1) {
        errors.add(
            "items",
            field_error("range", "Line item quantity must be at least 1"),
        );
        invalid = true;
    }
    if items.iter().any(|item| item.unit_price < Decimal::ZERO) {
        errors.add(
            "items",
            field_error("range", "Line item unit price cannot be negative"),
        );
        invalid = true;
    }
    if tax.is_some_and(|t| t < Decimal::ZERO) {
        errors.add("tax", field_error("range", "Tax cannot be negative"));
        invalid = true;
    }
    match discount {
        Some(Discount::Amount(amount)) if *amount < Decimal::ZERO => {
            errors.add(
                "discount",
                field_error("range", "Discount cannot be negative"),
            );
            invalid = true;
        }
        Some(Discount::Percentage(pct)) if *pct < Decimal::ZERO || *pct > Decimal::ONE_HUNDRED => {
            errors.add(
                "discount",
                field_error("range", "Discount percentage must be between 0 and 100"),
            );
            invalid = true;
        }
        _ => {}
    }

    if invalid {
        return None;
    }

    let out_of_range = |errors: &mut ValidationErrors| {
        errors.add(
            "items",
            field_error("range", "Invoice amounts are too large"),
        );
    };

    let Some(priced) = items
        .iter()
        .map(LineItemInput::priced)
        .collect::<Option<Vec<LineItem>>>()
    else {
        out_of_range(errors);
        return None;
    };
    let Some(subtotal) = priced
        .iter()
        .try_fold(Decimal::ZERO, |sum, item| sum.checked_add(item.total))
    else {
        out_of_range(errors);
        return None;
    };
    let Some(discount_amount) = discount.map_or(Some(Decimal::ZERO), |d| d.amount_for(subtotal))
    else {
        out_of_range(errors);
        return None;
    };

    if discount_amount > subtotal {
        errors.add(
            "discount",
            field_error("range", "Discount cannot exceed the subtotal"),
        );
        return None;
    }

    let tax = tax.unwrap_or(Decimal::ZERO);
    // discount_amount <= subtotal, so only the tax can push the total over.
    let Some(total) = (subtotal - discount_amount).checked_add(tax) else {
        out_of_range(errors);
        return None;
    };

    Some((
        priced,
        Totals {
            subtotal,
            discount_amount,
            tax,
            total,
        },
    ))
}

/// Invoice document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub number: String,

    pub client_name: String,
    pub client_phone: Option<String>,
    pub client_email: Option<String>,
    pub client_address: Option<String>,

    pub items: Vec<LineItem>,
    pub subtotal: Decimal,
    pub discount: Option<Discount>,
    pub discount_amount: Decimal,
    pub tax: Option<Decimal>,
    pub total: Decimal,

    pub status: InvoiceStatus,
    pub paid: bool,
    pub withdrawn: bool,
    pub payment_method: Option<PaymentMethod>,

    pub deposit_date: DateTime<Utc>,
    pub estimated_ready_date: Option<DateTime<Utc>>,
    pub payment_date: Option<DateTime<Utc>>,
    pub withdrawal_date: Option<DateTime<Utc>>,

    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<Uuid>,
    pub cancelled_by_name: Option<String>,

    pub created_at: DateTime<Utc>,
    pub created_by: Uuid,
    pub created_by_name: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub modified_by: Option<Uuid>,
    pub modified_by_name: Option<String>,

    pub urgency: Urgency,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub source_invoice_id: Option<Uuid>,
}

/// The lifecycle columns a transition reads before it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleState {
    pub status: InvoiceStatus,
    pub paid: bool,
    pub withdrawn: bool,
}

impl Invoice {
    pub fn is_cancelled(&self) -> bool {
        self.status == InvoiceStatus::Cancelled
    }

    pub fn lifecycle(&self) -> LifecycleState {
        LifecycleState {
            status: self.status,
            paid: self.paid,
            withdrawn: self.withdrawn,
        }
    }

    pub fn apply_totals(&mut self, items: Vec<LineItem>, totals: Totals) {
        self.items = items;
        self.subtotal = totals.subtotal;
        self.discount_amount = totals.discount_amount;
        self.total = totals.total;
    }

    /// Derived figures shown alongside a single invoice.
    pub fn stats(&self, now: DateTime<Utc>) -> InvoiceStats {
        let overdue = !self.is_cancelled()
            && !self.withdrawn
            && self.estimated_ready_date.is_some_and(|ready| ready < now);

        InvoiceStats {
            item_count: self.items.len(),
            total_quantity: self.items.iter().map(|i| i64::from(i.quantity)).sum(),
            days_since_deposit: (now - self.deposit_date).num_days().max(0),
            overdue,
        }
    }
}

/// Derived statistics for a single invoice.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceStats {
    pub item_count: usize,
    pub total_quantity: i64,
    pub days_since_deposit: i64,
    pub overdue: bool,
}

/// Input for creating an invoice.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoiceInput {
    /// Client-generated id; makes a repeated create a no-op.
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    #[validate(length(min = 1, message = "Client name is required"))]
    pub client_name: String,
    #[serde(default)]
    pub client_phone: Option<String>,
    #[serde(default)]
    #[validate(email(message = "Client email is invalid"))]
    pub client_email: Option<String>,
    #[serde(default)]
    pub client_address: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, message = "At least one line item is required"))]
    pub items: Vec<LineItemInput>,
    #[serde(default)]
    pub discount: Option<Discount>,
    #[serde(default)]
    pub tax: Option<Decimal>,
    #[serde(default)]
    #[validate(required(message = "Deposit date is required"))]
    pub deposit_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_ready_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Partial update of an invoice. Lifecycle flags are not updatable here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInvoiceInput {
    #[serde(default)]
    #[validate(length(min = 1, message = "Client name cannot be empty"))]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_phone: Option<String>,
    #[serde(default)]
    #[validate(email(message = "Client email is invalid"))]
    pub client_email: Option<String>,
    #[serde(default)]
    pub client_address: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<LineItemInput>>,
    #[serde(default)]
    pub discount: Option<Discount>,
    #[serde(default)]
    pub tax: Option<Decimal>,
    #[serde(default)]
    pub deposit_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_ready_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl UpdateInvoiceInput {
    /// Whether the update touches amounts, which forces a recomputation.
    pub fn touches_financials(&self) -> bool {
        self.items.is_some() || self.discount.is_some() || self.tax.is_some()
    }

    /// Copy the non-financial fields onto `invoice`.
    pub fn merge_metadata(&self, invoice: &mut Invoice) {
        if let Some(name) = &self.client_name {
            invoice.client_name = name.trim().to_string();
        }
        if let Some(phone) = &self.client_phone {
            invoice.client_phone = Some(phone.clone());
        }
        if let Some(email) = &self.client_email {
            invoice.client_email = Some(email.clone());
        }
        if let Some(address) = &self.client_address {
            invoice.client_address = Some(address.clone());
        }
        if let Some(date) = self.deposit_date {
            invoice.deposit_date = date;
        }
        if let Some(date) = self.estimated_ready_date {
            invoice.estimated_ready_date = Some(date);
        }
        if let Some(urgency) = self.urgency {
            invoice.urgency = urgency;
        }
        if let Some(tags) = &self.tags {
            invoice.tags = tags.clone();
        }
        if let Some(notes) = &self.notes {
            invoice.notes = Some(notes.clone());
        }
    }
}

/// Input for recording a payment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayInput {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}
