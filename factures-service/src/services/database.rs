//! PostgreSQL data store for factures-service.

use crate::models::{
    Discount, Invoice, InvoicePage, InvoiceQuery, InvoiceStatus, LifecycleState, LineItem,
    OperationKind, Permission, PaymentMethod, Resource, Role, SearchTerm, SortField, SortOrder, Urgency, User,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    format_number, ClientActivity, ClientStats, DataStore, InvoiceNumbering,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use service_core::error::AppError;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const INVOICE_COLUMNS: &str = r#"
    id, tenant_id, number, client_name, client_phone, client_email, client_address,
    items, subtotal, discount, discount_amount, tax, total,
    status, paid, withdrawn, payment_method,
    deposit_date, estimated_ready_date, payment_date, withdrawal_date,
    cancelled_at, cancellation_reason, cancelled_by, cancelled_by_name,
    created_at, created_by, created_by_name, modified_at, modified_by, modified_by_name,
    urgency, tags, notes, source_invoice_id
"#;

/// Filter predicate shared by the count and page queries. `$1` is the tenant.
const SEARCH_PREDICATE: &str = r#"
    tenant_id = $1
      AND ($2::text IS NULL OR status = $2)
      AND ($3::bool IS NULL OR paid = $3)
      AND ($4::bool IS NULL OR withdrawn = $4)
      AND ($5::text IS NULL OR urgency = $5)
      AND ($6::timestamptz IS NULL OR deposit_date >= $6)
      AND ($7::timestamptz IS NULL OR deposit_date <= $7)
      AND ($8::numeric IS NULL OR total >= $8)
      AND ($9::numeric IS NULL OR total <= $9)
      AND ($10::uuid IS NULL OR created_by = $10)
      AND ($11::text IS NULL
           OR number ILIKE $11
           OR client_name ILIKE $11
           OR client_phone ILIKE $11
           OR client_email ILIKE $11
           OR notes ILIKE $11
           OR ($12::numeric IS NOT NULL AND (total = $12 OR subtotal = $12)))
      AND ($13::text IS NULL OR EXISTS (SELECT 1 FROM unnest(tags) AS tag WHERE tag ILIKE $13))
"#;

type PgQueryAs<'q, O> = sqlx::query::QueryAs<'q, Postgres, O, PgArguments>;

#[derive(Debug, FromRow)]
struct InvoiceRow {
    id: Uuid,
    tenant_id: Uuid,
    number: String,
    client_name: String,
    client_phone: Option<String>,
    client_email: Option<String>,
    client_address: Option<String>,
    items: Json<Vec<LineItem>>,
    subtotal: Decimal,
    discount: Option<Json<Discount>>,
    discount_amount: Decimal,
    tax: Option<Decimal>,
    total: Decimal,
    status: String,
    paid: bool,
    withdrawn: bool,
    payment_method: Option<String>,
    deposit_date: DateTime<Utc>,
    estimated_ready_date: Option<DateTime<Utc>>,
    payment_date: Option<DateTime<Utc>>,
    withdrawal_date: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    cancelled_by: Option<Uuid>,
    cancelled_by_name: Option<String>,
    created_at: DateTime<Utc>,
    created_by: Uuid,
    created_by_name: String,
    modified_at: Option<DateTime<Utc>>,
    modified_by: Option<Uuid>,
    modified_by_name: Option<String>,
    urgency: String,
    tags: Vec<String>,
    notes: Option<String>,
    source_invoice_id: Option<Uuid>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = AppError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        let corrupt = |e: String| AppError::DatabaseError(anyhow::anyhow!("Corrupt invoice row: {}", e));
        let payment_method = row
            .payment_method
            .as_deref()
            .map(str::parse::<PaymentMethod>)
            .transpose()
            .map_err(corrupt)?;

        Ok(Invoice {
            id: row.id,
            tenant_id: row.tenant_id,
            number: row.number,
            client_name: row.client_name,
            client_phone: row.client_phone,
            client_email: row.client_email,
            client_address: row.client_address,
            items: row.items.0,
            subtotal: row.subtotal,
            discount: row.discount.map(|d| d.0),
            discount_amount: row.discount_amount,
            tax: row.tax,
            total: row.total,
            status: row.status.parse::<InvoiceStatus>().map_err(corrupt)?,
            paid: row.paid,
            withdrawn: row.withdrawn,
            payment_method,
            deposit_date: row.deposit_date,
            estimated_ready_date: row.estimated_ready_date,
            payment_date: row.payment_date,
            withdrawal_date: row.withdrawal_date,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            cancelled_by: row.cancelled_by,
            cancelled_by_name: row.cancelled_by_name,
            created_at: row.created_at,
            created_by: row.created_by,
            created_by_name: row.created_by_name,
            modified_at: row.modified_at,
            modified_by: row.modified_by,
            modified_by_name: row.modified_by_name,
            urgency: row.urgency.parse::<Urgency>().map_err(corrupt)?,
            tags: row.tags,
            notes: row.notes,
            source_invoice_id: row.source_invoice_id,
        })
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    tenant_id: Uuid,
    email: String,
    display_name: String,
    role: String,
    is_active: bool,
    permissions: Json<BTreeMap<String, bool>>,
}

impl TryFrom<UserRow> for User {
    type Error = AppError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = row
            .role
            .parse::<Role>()
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Corrupt user row: {}", e)))?;

        let mut permissions = BTreeMap::new();
        for (name, granted) in row.permissions.0 {
            match name.parse::<Permission>() {
                Ok(permission) => {
                    permissions.insert(permission, granted);
                }
                Err(_) => warn!(user_id = %row.id, permission = %name, "Ignoring unknown permission"),
            }
        }

        Ok(User {
            id: row.id,
            tenant_id: row.tenant_id,
            email: row.email,
            display_name: row.display_name,
            role,
            is_active: row.is_active,
            permissions,
        })
    }
}

/// Map a sqlx failure, treating connectivity loss as `ServiceUnavailable`.
fn store_error(context: &str, err: sqlx::Error) -> AppError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => {
            warn!(error = %err, "{}: database unreachable", context);
            AppError::ServiceUnavailable
        }
        other => AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, other)),
    }
}

/// Escape LIKE metacharacters and wrap for substring matching.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn order_clause(sort: SortField, order: SortOrder) -> &'static str {
    match (sort, order) {
        (SortField::Relevance, _) => "created_at DESC, id ASC",
        (SortField::Date, SortOrder::Asc) => "created_at ASC, id ASC",
        (SortField::Date, SortOrder::Desc) => "created_at DESC, id ASC",
        (SortField::Amount, SortOrder::Asc) => "total ASC, created_at DESC, id ASC",
        (SortField::Amount, SortOrder::Desc) => "total DESC, created_at DESC, id ASC",
        (SortField::Client, SortOrder::Asc) => "lower(client_name) ASC, created_at DESC, id ASC",
        (SortField::Client, SortOrder::Desc) => "lower(client_name) DESC, created_at DESC, id ASC",
    }
}

fn bind_search<'q, O>(query: PgQueryAs<'q, O>, tenant_id: Uuid, q: &InvoiceQuery) -> PgQueryAs<'q, O> {
    let (text, amount, tag) = match &q.term {
        Some(SearchTerm::Text { needle, amount }) => (Some(like_pattern(needle)), *amount, None),
        Some(SearchTerm::Tag(tag)) => (None, None, Some(like_pattern(tag))),
        None => (None, None, None),
    };
    let f = &q.filters;
    query
        .bind(tenant_id)
        .bind(f.status.map(|s| s.as_str().to_string()))
        .bind(f.paid)
        .bind(f.withdrawn)
        .bind(f.urgency.map(|u| u.as_str().to_string()))
        .bind(f.date_from)
        .bind(f.date_to)
        .bind(f.min_amount)
        .bind(f.max_amount)
        .bind(f.created_by)
        .bind(text)
        .bind(amount)
        .bind(tag)
}

/// Bind every invoice column, in `INVOICE_COLUMNS` order, as `$1..$35`.
fn bind_invoice<'q, O>(query: PgQueryAs<'q, O>, invoice: &Invoice) -> PgQueryAs<'q, O> {
    query
        .bind(invoice.id)
        .bind(invoice.tenant_id)
        .bind(invoice.number.clone())
        .bind(invoice.client_name.clone())
        .bind(invoice.client_phone.clone())
        .bind(invoice.client_email.clone())
        .bind(invoice.client_address.clone())
        .bind(Json(invoice.items.clone()))
        .bind(invoice.subtotal)
        .bind(invoice.discount.map(Json))
        .bind(invoice.discount_amount)
        .bind(invoice.tax)
        .bind(invoice.total)
        .bind(invoice.status.as_str())
        .bind(invoice.paid)
        .bind(invoice.withdrawn)
        .bind(invoice.payment_method.map(|m| m.as_str()))
        .bind(invoice.deposit_date)
        .bind(invoice.estimated_ready_date)
        .bind(invoice.payment_date)
        .bind(invoice.withdrawal_date)
        .bind(invoice.cancelled_at)
        .bind(invoice.cancellation_reason.clone())
        .bind(invoice.cancelled_by)
        .bind(invoice.cancelled_by_name.clone())
        .bind(invoice.created_at)
        .bind(invoice.created_by)
        .bind(invoice.created_by_name.clone())
        .bind(invoice.modified_at)
        .bind(invoice.modified_by)
        .bind(invoice.modified_by_name.clone())
        .bind(invoice.urgency.as_str())
        .bind(invoice.tags.clone())
        .bind(invoice.notes.clone())
        .bind(invoice.source_invoice_id)
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "factures-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl DataStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Health check failed", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_user"])
            .start_timer();

        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, tenant_id, email, display_name, role, is_active, permissions
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to get user", e))?;

        timer.observe_duration();

        row.map(User::try_from).transpose()
    }

    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.id))]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let sql = format!(
            r#"
            INSERT INTO invoices ({columns})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32,
                    $33, $34, $35)
            RETURNING {columns}
            "#,
            columns = INVOICE_COLUMNS
        );

        let row = bind_invoice(sqlx::query_as::<_, InvoiceRow>(&sql), invoice)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict(anyhow::anyhow!(
                        "Invoice {} or number {} already exists",
                        invoice.id,
                        invoice.number
                    ))
                }
                other => store_error("Failed to insert invoice", other),
            })?;

        timer.observe_duration();

        info!(number = %row.number, "Invoice inserted");

        Invoice::try_from(row)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM invoices WHERE tenant_id = $1 AND id = $2",
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(tenant_id)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("Failed to get invoice", e))?;

        timer.observe_duration();

        row.map(Invoice::try_from).transpose()
    }

    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.id))]
    async fn save_invoice(
        &self,
        invoice: &Invoice,
        expected: LifecycleState,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_invoice"])
            .start_timer();

        // Lifecycle columns only move forward; creation fields are immutable.
        let sql = format!(
            r#"
            UPDATE invoices SET
                client_name = $4, client_phone = $5, client_email = $6, client_address = $7,
                items = $8, subtotal = $9, discount = $10, discount_amount = $11, tax = $12,
                total = $13,
                status = CASE WHEN invoices.status = 'cancelled' THEN 'cancelled' ELSE $14 END,
                paid = invoices.paid OR $15,
                withdrawn = invoices.withdrawn OR $16,
                payment_method = CASE WHEN invoices.paid THEN invoices.payment_method ELSE $17 END,
                deposit_date = $18,
                estimated_ready_date = $19,
                payment_date = CASE WHEN invoices.paid THEN invoices.payment_date ELSE $20 END,
                withdrawal_date = CASE WHEN invoices.withdrawn THEN invoices.withdrawal_date ELSE $21 END,
                cancelled_at = CASE WHEN invoices.status = 'cancelled' THEN invoices.cancelled_at ELSE $22 END,
                cancellation_reason = CASE WHEN invoices.status = 'cancelled' THEN invoices.cancellation_reason ELSE $23 END,
                cancelled_by = CASE WHEN invoices.status = 'cancelled' THEN invoices.cancelled_by ELSE $24 END,
                cancelled_by_name = CASE WHEN invoices.status = 'cancelled' THEN invoices.cancelled_by_name ELSE $25 END,
                modified_at = $29, modified_by = $30, modified_by_name = $31,
                urgency = $32, tags = $33, notes = $34
            WHERE id = $1 AND tenant_id = $2 AND number = $3
              AND status = $36 AND paid = $37 AND withdrawn = $38
            RETURNING {columns}
            "#,
            columns = INVOICE_COLUMNS
        );

        // No row means another writer moved the lifecycle first.
        let row = bind_invoice(sqlx::query_as::<_, InvoiceRow>(&sql), invoice)
            .bind(expected.status.as_str())
            .bind(expected.paid)
            .bind(expected.withdrawn)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("Failed to save invoice", e))?
            .ok_or_else(|| AppError::Conflict(anyhow::anyhow!("Invoice was modified concurrently")))?;

        timer.observe_duration();

        Invoice::try_from(row)
    }

    #[instrument(skip(self, query), fields(tenant_id = %tenant_id, sort = query.sort.as_str()))]
    async fn query_invoices(
        &self,
        tenant_id: Uuid,
        query: &InvoiceQuery,
    ) -> Result<InvoicePage, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["query_invoices"])
            .start_timer();

        let count_sql = format!("SELECT COUNT(*) FROM invoices WHERE {}", SEARCH_PREDICATE);
        let (total,) = bind_search(sqlx::query_as::<_, (i64,)>(&count_sql), tenant_id, query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_error("Failed to count invoices", e))?;

        let page_sql = format!(
            "SELECT {} FROM invoices WHERE {} ORDER BY {} LIMIT $14 OFFSET $15",
            INVOICE_COLUMNS,
            SEARCH_PREDICATE,
            order_clause(query.sort, query.order)
        );
        let (limit, offset) = match query.window {
            Some(window) => (Some(window.limit), window.offset),
            None => (None, 0),
        };
        let rows = bind_search(sqlx::query_as::<_, InvoiceRow>(&page_sql), tenant_id, query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("Failed to query invoices", e))?;

        timer.observe_duration();

        let invoices = rows
            .into_iter()
            .map(Invoice::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(InvoicePage { invoices, total })
    }

    #[instrument(skip(self, payload), fields(tenant_id = %tenant_id, resource = resource.as_str(), kind = kind.as_str()))]
    async fn apply_mutation(
        &self,
        tenant_id: Uuid,
        resource: Resource,
        kind: OperationKind,
        payload: &Value,
    ) -> Result<(), AppError> {
        if resource != Resource::Articles {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Resource {} is not a generic resource",
                resource.as_str()
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_mutation"])
            .start_timer();

        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Payload has no valid id")))?;

        let result = match kind {
            OperationKind::Create => {
                sqlx::query(
                    r#"
                    INSERT INTO articles (id, tenant_id, name, category, price, active)
                    SELECT p.id, $2, p.name, p.category, p.price, COALESCE(p.active, TRUE)
                    FROM jsonb_populate_record(NULL::articles, $1) AS p
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(Json(payload.clone()))
                .bind(tenant_id)
                .execute(&self.pool)
                .await
            }
            OperationKind::Update => {
                sqlx::query(
                    r#"
                    UPDATE articles AS a SET
                        name = COALESCE(p.name, a.name),
                        category = COALESCE(p.category, a.category),
                        price = COALESCE(p.price, a.price),
                        active = COALESCE(p.active, a.active)
                    FROM jsonb_populate_record(NULL::articles, $1) AS p
                    WHERE a.id = $3 AND a.tenant_id = $2
                    "#,
                )
                .bind(Json(payload.clone()))
                .bind(tenant_id)
                .bind(id)
                .execute(&self.pool)
                .await
            }
            OperationKind::Delete => {
                sqlx::query("DELETE FROM articles WHERE id = $1 AND tenant_id = $2")
                    .bind(id)
                    .bind(tenant_id)
                    .execute(&self.pool)
                    .await
            }
        };

        let result = result.map_err(|e| store_error("Failed to apply mutation", e))?;

        timer.observe_duration();

        if kind == OperationKind::Update && result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!("Article {} not found", id)));
        }

        Ok(())
    }
}

#[async_trait]
impl InvoiceNumbering for Database {
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn next_number(&self, tenant_id: Uuid) -> Result<String, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["next_number"])
            .start_timer();

        let (sequence,) = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO invoice_counters (tenant_id, last_value)
            VALUES ($1, 1)
            ON CONFLICT (tenant_id) DO UPDATE SET last_value = invoice_counters.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("Failed to allocate invoice number", e))?;

        timer.observe_duration();

        Ok(format_number(sequence))
    }
}

#[async_trait]
impl ClientStats for Database {
    #[instrument(skip(self, name), fields(tenant_id = %tenant_id))]
    async fn record_activity(
        &self,
        tenant_id: Uuid,
        phone: &str,
        name: &str,
        activity: ClientActivity,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_client_activity"])
            .start_timer();

        let (visits, spent) = match activity {
            ClientActivity::Visit => (1_i64, Decimal::ZERO),
            ClientActivity::Payment(amount) => (0_i64, amount),
        };

        sqlx::query(
            r#"
            INSERT INTO client_stats (tenant_id, phone, name, visit_count, total_spent, last_visit_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (tenant_id, phone) DO UPDATE SET
                name = EXCLUDED.name,
                visit_count = client_stats.visit_count + EXCLUDED.visit_count,
                total_spent = client_stats.total_spent + EXCLUDED.total_spent,
                last_visit_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(phone)
        .bind(name)
        .bind(visits)
        .bind(spent)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("Failed to record client activity", e))?;

        timer.observe_duration();

        Ok(())
    }
}
