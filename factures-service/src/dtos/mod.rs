pub mod envelope;
pub mod invoices;
pub mod search;

pub use envelope::ApiResponse;
pub use invoices::{
    parse_body, DeleteParams, InvoiceDetail, QueuedResponse, UpdateInvoiceRequest,
};
pub use search::{SearchBody, SearchHitResponse, SearchParams};
