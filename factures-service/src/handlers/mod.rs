pub mod health;
pub mod invoices;
pub mod queue;
pub mod search;

pub use health::{health_check, metrics_endpoint, readiness_check};
pub use invoices::{
    create_invoice, delete_invoice, delete_invoice_by_id, get_invoice, invoice_action,
    list_invoices, update_invoice, update_invoice_by_id,
};
pub use queue::{pending_count, replay_queue};
pub use search::{search_invoices, search_invoices_query};
