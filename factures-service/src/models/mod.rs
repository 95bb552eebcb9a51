//! Domain models for factures-service.

mod invoice;
mod line_item;
mod query;
mod queue;
mod user;

pub use invoice::{
    compute_totals, CreateInvoiceInput, Discount, Invoice, InvoiceStats, InvoiceStatus,
    LifecycleState, PayInput, PaymentMethod, Totals, UpdateInvoiceInput, Urgency,
};
pub use line_item::{LineItem, LineItemInput};
pub use query::{
    clamp_page, InvoiceFilters, InvoicePage, InvoiceQuery, Pagination, SearchTerm, SortField,
    SortOrder, Window, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, TAG_MARKER,
};
pub use queue::{
    InvoiceChange, InvoiceCreatePayload, InvoiceUpdatePayload, OfflineQueueEntry, OperationKind,
    ReplayReport, Resource, TargetId, MAX_RETRIES,
};
pub use user::{Permission, Role, User};
