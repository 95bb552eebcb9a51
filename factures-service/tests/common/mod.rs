//! Test helpers for factures-service integration tests.
//!
//! Everything runs against the in-memory adapters, so no database is needed.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use factures_service::models::{
    CreateInvoiceInput, Discount, Invoice, LineItemInput, Permission, Role, Urgency, User,
};
use factures_service::services::{
    InvoiceService, JwtVerifier, MemoryQueueStore, MemoryStore, QueueStore,
};
use factures_service::startup::{router, AppState};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use tower::ServiceExt;
use uuid::Uuid;

static TRACING: Once = Once::new();

pub const JWT_SECRET: &str = "factures-test-secret";

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn user(tenant_id: Uuid, role: Role, grants: &[Permission], name: &str) -> User {
    let permissions: BTreeMap<Permission, bool> = grants.iter().map(|p| (*p, true)).collect();
    User {
        id: Uuid::new_v4(),
        tenant_id,
        email: format!("{}@pressing.test", name.to_lowercase()),
        display_name: name.to_string(),
        role,
        is_active: true,
        permissions,
    }
}

/// One tenant with the usual cast of users.
pub struct Staff {
    pub tenant_id: Uuid,
    pub owner: User,
    /// May create invoices and cancel any invoice.
    pub manager: User,
    /// May create invoices but not cancel other people's.
    pub clerk: User,
    /// No grants at all.
    pub trainee: User,
    pub inactive: User,
}

impl Staff {
    pub fn new() -> Self {
        let tenant_id = Uuid::new_v4();
        let mut inactive = user(tenant_id, Role::Employee, &[Permission::CreateInvoice], "Dormant");
        inactive.is_active = false;

        Self {
            tenant_id,
            owner: user(tenant_id, Role::Owner, &[], "Awa"),
            manager: user(
                tenant_id,
                Role::Employee,
                &[Permission::CreateInvoice, Permission::CancelInvoice],
                "Moussa",
            ),
            clerk: user(tenant_id, Role::Employee, &[Permission::CreateInvoice], "Fatou"),
            trainee: user(tenant_id, Role::Employee, &[], "Ibrahima"),
            inactive,
        }
    }

    pub fn all(&self) -> Vec<&User> {
        vec![
            &self.owner,
            &self.manager,
            &self.clerk,
            &self.trainee,
            &self.inactive,
        ]
    }
}

pub fn item(quantity: i32, unit_price: i64) -> LineItemInput {
    LineItemInput {
        article_id: Uuid::new_v4(),
        label: Some("Chemise".to_string()),
        quantity,
        unit_price: Decimal::from(unit_price),
    }
}

/// Two shirts and a suit: 5,000 before discount.
pub fn create_input(client_name: &str) -> CreateInvoiceInput {
    CreateInvoiceInput {
        id: None,
        client_name: client_name.to_string(),
        client_phone: Some("+221770000001".to_string()),
        client_email: None,
        client_address: None,
        items: vec![item(2, 1000), item(1, 3000)],
        discount: Some(Discount::Amount(Decimal::from(500))),
        tax: None,
        deposit_date: Some(chrono::Utc::now()),
        estimated_ready_date: None,
        urgency: Urgency::Normal,
        tags: vec![],
        notes: None,
    }
}

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub queue_store: Arc<MemoryQueueStore>,
    pub state: AppState,
    pub staff: Staff,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::with_queue_store(Arc::new(MemoryQueueStore::new()))
    }

    pub fn with_queue_store(queue_store: Arc<MemoryQueueStore>) -> Self {
        init_tracing();

        let store = Arc::new(MemoryStore::new());
        let staff = Staff::new();
        for user in staff.all() {
            store.put_user(user.clone());
        }

        let verifier = JwtVerifier::new(&Secret::new(JWT_SECRET.to_string()));
        let state = AppState::in_memory(
            Arc::clone(&store),
            Arc::clone(&queue_store) as Arc<dyn QueueStore>,
            verifier,
        );

        Self {
            store,
            queue_store,
            state,
            staff,
        }
    }

    pub fn invoices(&self) -> &InvoiceService {
        &self.state.invoices
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    pub fn token(&self, user: &User) -> String {
        self.state
            .users
            .verifier()
            .issue(user.id, chrono::Duration::hours(1))
            .expect("Failed to issue token")
    }

    /// Simulate the store dropping or coming back.
    pub fn set_online(&self, online: bool) {
        self.store.set_available(online);
    }

    pub async fn seed_invoice(&self, by: &User, client_name: &str) -> Invoice {
        self.invoices()
            .create(by, create_input(client_name))
            .await
            .expect("Failed to seed invoice")
    }

    /// Send a request as `user` and decode the JSON body.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        user: Option<&User>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("authorization", format!("Bearer {}", self.token(user)));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");

        let response = self
            .router()
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }
}
