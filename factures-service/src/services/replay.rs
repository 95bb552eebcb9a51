//! Replay of queued mutations and the background sync loop.

use crate::models::{
    InvoiceChange, InvoiceCreatePayload, InvoiceUpdatePayload, OfflineQueueEntry, OperationKind,
    ReplayReport, Resource, TargetId, User,
};
use crate::services::connectivity::Connectivity;
use crate::services::invoices::{InvoiceError, InvoiceService};
use crate::services::offline_queue::{OfflineQueue, ReplayTarget};
use crate::services::store::DataStore;
use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, AppError> {
    Ok(serde_json::from_value(payload.clone())?)
}

/// Replays entries through the invoice state machine, acting as the user
/// that queued them. Other resources go straight to the data store.
pub struct ServiceReplayTarget {
    invoices: InvoiceService,
}

impl ServiceReplayTarget {
    pub fn new(invoices: InvoiceService) -> Self {
        Self { invoices }
    }

    async fn owner_of(&self, entry: &OfflineQueueEntry) -> Result<User, AppError> {
        let user = self
            .invoices
            .store()
            .get_user(entry.user_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Queued by unknown user")))?;

        if !user.is_active {
            return Err(AppError::Forbidden(anyhow::anyhow!("Queued by inactive user")));
        }
        if user.tenant_id != entry.tenant_id {
            return Err(AppError::Forbidden(anyhow::anyhow!("Tenant mismatch")));
        }
        Ok(user)
    }

    async fn apply_invoice(
        &self,
        user: &User,
        entry: &OfflineQueueEntry,
    ) -> Result<(), InvoiceError> {
        let decoded = |e: AppError| InvoiceError::Store(e);
        match entry.kind {
            OperationKind::Create => {
                let mut input: InvoiceCreatePayload = decode(&entry.payload).map_err(decoded)?;
                // Keyed by the entry id when the client sent none.
                input.id.get_or_insert(entry.id);
                self.invoices.create(user, input).await.map(|_| ())
            }
            OperationKind::Update => {
                let payload: InvoiceUpdatePayload = decode(&entry.payload).map_err(decoded)?;
                let id = payload.id;
                let outcome = match payload.change {
                    InvoiceChange::Pay(input) => self.invoices.pay(user, id, input).await,
                    InvoiceChange::Withdraw { date } => self.invoices.withdraw(user, id, date).await,
                    InvoiceChange::Cancel { reason } => self.invoices.cancel(user, id, &reason).await,
                    InvoiceChange::Duplicate { new_id } => {
                        let new_id = new_id.unwrap_or(entry.id);
                        self.invoices.duplicate(user, id, Some(new_id)).await
                    }
                    InvoiceChange::Update(patch) => self.invoices.update(user, id, patch).await,
                };
                outcome.map(|_| ())
            }
            OperationKind::Delete => {
                let target: TargetId = decode(&entry.payload).map_err(decoded)?;
                self.invoices.delete(user, target.id).await.map(|_| ())
            }
        }
    }
}

#[async_trait]
impl ReplayTarget for ServiceReplayTarget {
    #[instrument(skip(self, entry), fields(entry_id = %entry.id, user_id = %entry.user_id))]
    async fn apply(&self, entry: &OfflineQueueEntry) -> Result<(), AppError> {
        let user = self.owner_of(entry).await?;

        match entry.resource {
            Resource::Invoices => match self.apply_invoice(&user, entry).await {
                Ok(()) => Ok(()),
                // Already past this transition.
                Err(e) if e.is_already_applied() => {
                    warn!(error = %e, "Queued transition already applied, discarding");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            resource => {
                self.invoices
                    .store()
                    .apply_mutation(user.tenant_id, resource, entry.kind, &entry.payload)
                    .await
            }
        }
    }
}

/// Watches connectivity and drains the offline queue when it returns.
pub struct SyncEngine {
    store: Arc<dyn DataStore>,
    connectivity: Arc<Connectivity>,
    queue: Arc<OfflineQueue>,
    target: Arc<dyn ReplayTarget>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DataStore>,
        connectivity: Arc<Connectivity>,
        queue: Arc<OfflineQueue>,
        target: Arc<dyn ReplayTarget>,
    ) -> Self {
        Self {
            store,
            connectivity,
            queue,
            target,
        }
    }

    /// Check the store once. Coming back online triggers a replay of every
    /// pending journal. Returns the observed reachability.
    pub async fn probe(&self) -> bool {
        let online = self.store.health_check().await.is_ok();
        if self.connectivity.set_online(online) {
            self.replay_everyone().await;
        }
        online
    }

    /// Replay the caller's journal now.
    pub async fn replay_user(&self, user_id: Uuid) -> Result<ReplayReport, AppError> {
        self.queue.replay_all(user_id, self.target.as_ref()).await
    }

    /// Replay every user with pending entries, users concurrently.
    pub async fn replay_everyone(&self) -> Vec<(Uuid, ReplayReport)> {
        let users = self.queue.pending_users().await;
        if users.is_empty() {
            return Vec::new();
        }
        info!(users = users.len(), "Replaying offline journals");

        let passes = users.into_iter().map(|user_id| async move {
            (user_id, self.replay_user(user_id).await)
        });

        let mut reports = Vec::new();
        for (user_id, result) in join_all(passes).await {
            match result {
                Ok(report) => reports.push((user_id, report)),
                Err(e) => error!(user_id = %user_id, error = %e, "Replay failed"),
            }
        }
        reports
    }

    /// Probe forever at `every`.
    pub async fn run(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            self.probe().await;
        }
    }
}
