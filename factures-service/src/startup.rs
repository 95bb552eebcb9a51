use crate::config::{FacturesConfig, QueueBackend, StoreBackend};
use crate::handlers;
use crate::middleware::track_metrics;
use crate::services::{
    ClientStats, Connectivity, DataStore, Database, InvoiceNumbering, InvoiceService,
    JwtVerifier, LocalQueueStore, MemoryQueueStore, MemoryStore, OfflineQueue, QueueStore,
    ReplayTarget, SearchService, ServiceReplayTarget, SyncEngine, UserDirectory,
};
use axum::{
    body::Body,
    http::Request,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{request_id_middleware, REQUEST_ID_HEADER};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DataStore>,
    pub invoices: InvoiceService,
    pub search: SearchService,
    pub users: Arc<UserDirectory>,
    pub queue: Arc<OfflineQueue>,
    pub connectivity: Arc<Connectivity>,
    pub sync: Arc<SyncEngine>,
}

impl AppState {
    /// Wire the services over the given adapters.
    pub fn new(
        store: Arc<dyn DataStore>,
        numbering: Arc<dyn InvoiceNumbering>,
        client_stats: Arc<dyn ClientStats>,
        queue_store: Arc<dyn QueueStore>,
        verifier: JwtVerifier,
    ) -> Self {
        let invoices = InvoiceService::new(Arc::clone(&store), numbering, client_stats);
        let search = SearchService::new(Arc::clone(&store));
        let users = Arc::new(UserDirectory::new(verifier, Arc::clone(&store)));
        let queue = Arc::new(OfflineQueue::new(queue_store));
        let connectivity = Arc::new(Connectivity::default());

        let target: Arc<dyn ReplayTarget> = Arc::new(ServiceReplayTarget::new(invoices.clone()));
        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&connectivity),
            Arc::clone(&queue),
            target,
        ));

        Self {
            store,
            invoices,
            search,
            users,
            queue,
            connectivity,
            sync,
        }
    }

    /// State over a single in-memory store.
    pub fn in_memory(
        store: Arc<MemoryStore>,
        queue_store: Arc<dyn QueueStore>,
        verifier: JwtVerifier,
    ) -> Self {
        Self::new(store.clone(), store.clone(), store, queue_store, verifier)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route(
            "/invoices",
            get(handlers::list_invoices)
                .post(handlers::create_invoice)
                .put(handlers::update_invoice)
                .delete(handlers::delete_invoice),
        )
        .route(
            "/invoices/search",
            get(handlers::search_invoices_query).post(handlers::search_invoices),
        )
        .route(
            "/invoices/:id",
            get(handlers::get_invoice)
                .post(handlers::invoice_action)
                .put(handlers::update_invoice_by_id)
                .delete(handlers::delete_invoice_by_id),
        )
        .route("/offline-queue", get(handlers::pending_count))
        .route("/offline-queue/replay", post(handlers::replay_queue))
        .layer(from_fn(track_metrics))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default();
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                    tenant_id = tracing::field::Empty,
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

async fn build_state(config: &FacturesConfig) -> Result<AppState, AppError> {
    let verifier = JwtVerifier::new(&config.auth.jwt_secret);

    let queue_store: Arc<dyn QueueStore> = match config.queue.backend {
        QueueBackend::Local => Arc::new(
            LocalQueueStore::new(&config.queue.directory)
                .await
                .map_err(|e| {
                    tracing::error!(
                        "Failed to initialize offline queue at {}: {}",
                        config.queue.directory,
                        e
                    );
                    e
                })?,
        ),
        QueueBackend::Memory => Arc::new(MemoryQueueStore::new()),
    };

    let state = match config.store.backend {
        StoreBackend::Postgres => {
            let url = config.store.database_url.as_ref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required for postgres"))
            })?;
            let db = Database::new(
                url.expose_secret(),
                config.store.max_connections,
                config.store.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to PostgreSQL: {}", e);
                e
            })?;
            db.run_migrations().await.map_err(|e| {
                tracing::error!("Failed to run database migrations: {}", e);
                e
            })?;

            let db = Arc::new(db);
            AppState::new(db.clone(), db.clone(), db, queue_store, verifier)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store, data is not persisted");
            AppState::in_memory(Arc::new(MemoryStore::new()), queue_store, verifier)
        }
    };

    let restored = state.queue.restore().await?;
    if restored > 0 {
        tracing::info!(pending = restored, "Offline mutations awaiting replay");
    }

    Ok(state)
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
}

impl Application {
    pub async fn build(config: FacturesConfig) -> Result<Self, AppError> {
        let state = build_state(&config).await?;

        // Background reachability probe; replays journals on reconnect.
        let sync = Arc::clone(&state.sync);
        let every = config.queue.probe_interval;
        tokio::spawn(async move { sync.run(every).await });

        let app = router(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
