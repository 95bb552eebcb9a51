//! Services module for factures-service.

pub mod connectivity;
pub mod credentials;
pub mod database;
pub mod invoices;
pub mod memory;
pub mod metrics;
pub mod offline_queue;
pub mod permissions;
pub mod replay;
pub mod search;
pub mod store;

pub use connectivity::Connectivity;
pub use credentials::{JwtVerifier, UserDirectory};
pub use database::Database;
pub use invoices::{InvoiceError, InvoiceService};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use offline_queue::{LocalQueueStore, MemoryQueueStore, OfflineQueue, QueueStore, ReplayTarget};
pub use replay::{ServiceReplayTarget, SyncEngine};
pub use search::{SearchRequest, SearchService};
pub use store::{ClientActivity, ClientStats, DataStore, InvoiceNumbering};
