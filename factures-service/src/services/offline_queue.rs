//! Offline mutation queue.
//!
//! Each user owns an ordered journal of mutations recorded while the data
//! store was unreachable. Journals are persisted through a `QueueStore` and
//! replayed in enqueue order once connectivity returns. At most one replay
//! runs per user at a time.

use crate::models::{OfflineQueueEntry, ReplayReport};
use crate::services::metrics::{OFFLINE_QUEUE_PENDING, REPLAY_OUTCOMES_TOTAL};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use service_core::error::AppError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Durable storage for per-user journals.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self, user_id: Uuid) -> Result<Vec<OfflineQueueEntry>, AppError>;
    async fn persist(&self, user_id: Uuid, entries: &[OfflineQueueEntry]) -> Result<(), AppError>;
    /// Users that have a stored journal.
    async fn users(&self) -> Result<Vec<Uuid>, AppError>;
}

/// One JSON journal per user in a local directory.
pub struct LocalQueueStore {
    base_path: PathBuf,
}

impl LocalQueueStore {
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let base_path = base_path.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path).await?;
        }
        Ok(Self { base_path })
    }

    fn journal(&self, user_id: Uuid) -> PathBuf {
        self.base_path.join(format!("{}.json", user_id))
    }
}

#[async_trait]
impl QueueStore for LocalQueueStore {
    async fn load(&self, user_id: Uuid) -> Result<Vec<OfflineQueueEntry>, AppError> {
        let path = self.journal(user_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(&path).await?;
        serde_json::from_slice(&data).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!(
                "Corrupt offline journal {}: {}",
                path.display(),
                e
            ))
        })
    }

    async fn persist(&self, user_id: Uuid, entries: &[OfflineQueueEntry]) -> Result<(), AppError> {
        let path = self.journal(user_id);
        if entries.is_empty() {
            if path.exists() {
                fs::remove_file(path).await?;
            }
            return Ok(());
        }

        let data = serde_json::to_vec_pretty(entries)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Encode journal: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn users(&self) -> Result<Vec<Uuid>, AppError> {
        let mut users = Vec::new();
        let mut dir = fs::read_dir(&self.base_path).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                users.push(id);
            }
        }
        Ok(users)
    }
}

/// Volatile journals, for tests and single-process development.
#[derive(Default)]
pub struct MemoryQueueStore {
    journals: DashMap<Uuid, Vec<OfflineQueueEntry>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self, user_id: Uuid) -> Result<Vec<OfflineQueueEntry>, AppError> {
        Ok(self
            .journals
            .get(&user_id)
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }

    async fn persist(&self, user_id: Uuid, entries: &[OfflineQueueEntry]) -> Result<(), AppError> {
        if entries.is_empty() {
            self.journals.remove(&user_id);
        } else {
            self.journals.insert(user_id, entries.to_vec());
        }
        Ok(())
    }

    async fn users(&self) -> Result<Vec<Uuid>, AppError> {
        Ok(self.journals.iter().map(|entry| *entry.key()).collect())
    }
}

/// Applies one queued mutation to the data store.
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    async fn apply(&self, entry: &OfflineQueueEntry) -> Result<(), AppError>;
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Journal of one user.
pub struct UserQueue {
    user_id: Uuid,
    store: Arc<dyn QueueStore>,
    entries: Mutex<Vec<OfflineQueueEntry>>,
    replaying: AtomicBool,
}

impl UserQueue {
    fn new(user_id: Uuid, store: Arc<dyn QueueStore>, entries: Vec<OfflineQueueEntry>) -> Self {
        Self {
            user_id,
            store,
            entries: Mutex::new(entries),
            replaying: AtomicBool::new(false),
        }
    }

    pub async fn count(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn entries(&self) -> Vec<OfflineQueueEntry> {
        self.entries.lock().await.clone()
    }

    /// Append an entry. Returns the pending count.
    pub async fn enqueue(&self, entry: OfflineQueueEntry) -> Result<usize, AppError> {
        let mut entries = self.entries.lock().await;
        entries.push(entry);
        if let Err(e) = self.store.persist(self.user_id, &entries).await {
            entries.pop();
            return Err(e);
        }
        OFFLINE_QUEUE_PENDING.inc();
        Ok(entries.len())
    }

    /// Replay pending entries in order, one attempt each.
    ///
    /// A call made while another replay is running returns immediately with
    /// `skipped` set. Losing the store mid-pass stops the pass without
    /// charging a retry to the remaining entries.
    pub async fn replay_all(&self, target: &dyn ReplayTarget) -> Result<ReplayReport, AppError> {
        let mut report = ReplayReport::default();

        if self.replaying.swap(true, Ordering::SeqCst) {
            REPLAY_OUTCOMES_TOTAL.with_label_values(&["skipped"]).inc();
            debug!(user_id = %self.user_id, "Replay already in flight");
            report.skipped = true;
            report.pending = self.count().await;
            return Ok(report);
        }
        let _in_flight = InFlight(&self.replaying);

        let snapshot = self.entries().await;
        for entry in snapshot {
            match target.apply(&entry).await {
                Ok(()) => {
                    self.remove(entry.id).await?;
                    report.applied += 1;
                    REPLAY_OUTCOMES_TOTAL.with_label_values(&["applied"]).inc();
                    info!(
                        user_id = %self.user_id,
                        entry_id = %entry.id,
                        kind = entry.kind.as_str(),
                        resource = entry.resource.as_str(),
                        "Offline mutation replayed"
                    );
                }
                Err(AppError::ServiceUnavailable) => {
                    warn!(user_id = %self.user_id, entry_id = %entry.id, "Store unreachable, replay interrupted");
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    if self.record_failure(entry.id, e.to_string()).await? {
                        report.dropped += 1;
                        REPLAY_OUTCOMES_TOTAL.with_label_values(&["dropped"]).inc();
                    } else {
                        report.failed += 1;
                        REPLAY_OUTCOMES_TOTAL.with_label_values(&["failed"]).inc();
                    }
                }
            }
        }

        report.pending = self.count().await;
        Ok(report)
    }

    async fn remove(&self, entry_id: Uuid) -> Result<(), AppError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.id != entry_id);
        if entries.len() != before {
            OFFLINE_QUEUE_PENDING.dec();
        }
        self.store.persist(self.user_id, &entries).await
    }

    /// Returns true when the entry was discarded after its last retry.
    async fn record_failure(&self, entry_id: Uuid, error: String) -> Result<bool, AppError> {
        let mut entries = self.entries.lock().await;
        let Some(position) = entries.iter().position(|e| e.id == entry_id) else {
            return Ok(false);
        };

        let exhausted = entries[position].record_failure(error.clone());
        if exhausted {
            let dropped = entries.remove(position);
            OFFLINE_QUEUE_PENDING.dec();
            warn!(
                user_id = %self.user_id,
                entry_id = %entry_id,
                kind = dropped.kind.as_str(),
                resource = dropped.resource.as_str(),
                retries = dropped.retry_count,
                error = %error,
                "Offline mutation dropped after exhausting retries"
            );
        } else {
            warn!(
                user_id = %self.user_id,
                entry_id = %entry_id,
                retries = entries[position].retry_count,
                error = %error,
                "Offline mutation replay failed"
            );
        }

        self.store.persist(self.user_id, &entries).await?;
        Ok(exhausted)
    }
}

/// Registry of per-user journals.
pub struct OfflineQueue {
    store: Arc<dyn QueueStore>,
    queues: DashMap<Uuid, Arc<UserQueue>>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            queues: DashMap::new(),
        }
    }

    /// Load every stored journal, e.g. after a restart.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize, AppError> {
        let mut pending = 0;
        for user_id in self.store.users().await? {
            pending += self.for_user(user_id).await?.count().await;
        }
        info!(pending, "Offline journals restored");
        Ok(pending)
    }

    /// The journal of `user_id`, loading it on first use.
    pub async fn for_user(&self, user_id: Uuid) -> Result<Arc<UserQueue>, AppError> {
        if let Some(queue) = self.queues.get(&user_id) {
            return Ok(Arc::clone(queue.value()));
        }

        let entries = self.store.load(user_id).await?;
        let loaded = entries.len() as i64;
        let queue = match self.queues.entry(user_id) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                OFFLINE_QUEUE_PENDING.add(loaded);
                let queue = Arc::new(UserQueue::new(user_id, Arc::clone(&self.store), entries));
                slot.insert(Arc::clone(&queue));
                queue
            }
        };
        Ok(queue)
    }

    #[instrument(skip(self, entry), fields(user_id = %entry.user_id, kind = entry.kind.as_str(), resource = entry.resource.as_str()))]
    pub async fn enqueue(&self, entry: OfflineQueueEntry) -> Result<usize, AppError> {
        let entry_id = entry.id;
        let pending = self.for_user(entry.user_id).await?.enqueue(entry).await?;
        info!(entry_id = %entry_id, pending, "Mutation queued for replay");
        Ok(pending)
    }

    pub async fn count(&self, user_id: Uuid) -> Result<usize, AppError> {
        Ok(self.for_user(user_id).await?.count().await)
    }

    #[instrument(skip(self, target), fields(user_id = %user_id))]
    pub async fn replay_all(
        &self,
        user_id: Uuid,
        target: &dyn ReplayTarget,
    ) -> Result<ReplayReport, AppError> {
        let report = self.for_user(user_id).await?.replay_all(target).await?;
        if !report.skipped {
            info!(
                applied = report.applied,
                failed = report.failed,
                dropped = report.dropped,
                pending = report.pending,
                interrupted = report.interrupted,
                "Replay pass finished"
            );
        }
        Ok(report)
    }

    /// Users with at least one pending entry among loaded journals.
    pub async fn pending_users(&self) -> Vec<Uuid> {
        let queues: Vec<Arc<UserQueue>> = self
            .queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut users = Vec::new();
        for queue in queues {
            if queue.count().await > 0 {
                users.push(queue.user_id);
            }
        }
        users
    }
}
