//! Invoice endpoints.
//!
//! Mutations run against the data store while it is reachable. When it is
//! not, or when it drops mid-request, the mutation is journaled for the
//! caller and answered with `202 Accepted`.

use crate::dtos::{
    parse_body, ApiResponse, DeleteParams, InvoiceDetail, QueuedResponse, SearchHitResponse,
    SearchParams, UpdateInvoiceRequest,
};
use crate::middleware::AuthUser;
use crate::models::{
    CreateInvoiceInput, Invoice, InvoiceChange, InvoiceUpdatePayload, OfflineQueueEntry,
    OperationKind, Resource, TargetId, UpdateInvoiceInput, User,
};
use crate::services::{InvoiceError, InvoiceService, SearchRequest};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::Value;
use service_core::error::AppError;
use std::future::Future;
use uuid::Uuid;

enum Outcome {
    Applied(Invoice),
    Queued(QueuedResponse),
}

impl Outcome {
    fn respond(self, status: StatusCode, message: &str) -> Response {
        match self {
            Outcome::Applied(invoice) => (
                status,
                Json(ApiResponse::ok(invoice).with_message(message)),
            )
                .into_response(),
            Outcome::Queued(queued) => (
                StatusCode::ACCEPTED,
                Json(ApiResponse::ok(queued).with_message("Queued for synchronization")),
            )
                .into_response(),
        }
    }
}

async fn enqueue(
    state: &AppState,
    user: &User,
    kind: OperationKind,
    payload: Value,
) -> Result<QueuedResponse, AppError> {
    let entry = OfflineQueueEntry::new(user, kind, Resource::Invoices, payload);
    let entry_id = entry.id;
    let pending = state.queue.enqueue(entry).await?;
    Ok(QueuedResponse {
        queued: true,
        entry_id,
        pending,
    })
}

/// Apply `op`, or journal `payload` when the store is unreachable. Offline,
/// `precheck` stands in for the checks `op` would have made.
async fn apply_or_queue<F>(
    state: &AppState,
    user: &User,
    kind: OperationKind,
    payload: Value,
    precheck: impl FnOnce() -> Result<(), InvoiceError>,
    op: F,
) -> Result<Outcome, AppError>
where
    F: Future<Output = Result<Invoice, InvoiceError>>,
{
    if !state.connectivity.is_online() {
        precheck()?;
        return Ok(Outcome::Queued(enqueue(state, user, kind, payload).await?));
    }

    match op.await {
        Ok(invoice) => Ok(Outcome::Applied(invoice)),
        Err(e) if e.is_unavailable() => {
            state.connectivity.set_online(false);
            Ok(Outcome::Queued(enqueue(state, user, kind, payload).await?))
        }
        Err(e) => Err(e.into()),
    }
}

fn past_tense(change: &InvoiceChange) -> &'static str {
    match change {
        InvoiceChange::Pay(_) => "Invoice paid",
        InvoiceChange::Withdraw { .. } => "Invoice withdrawn",
        InvoiceChange::Cancel { .. } => "Invoice cancelled",
        InvoiceChange::Duplicate { .. } => "Invoice duplicated",
        InvoiceChange::Update(_) => "Invoice updated",
    }
}

pub async fn list_invoices(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, AppError> {
    let results = state
        .search
        .search(user.tenant_id, SearchRequest::from(params))
        .await?;

    let invoices: Vec<SearchHitResponse> =
        results.hits.into_iter().map(SearchHitResponse::from).collect();
    Ok(Json(
        ApiResponse::ok(invoices).with_pagination(results.pagination),
    ))
}

pub async fn create_invoice(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let input: CreateInvoiceInput = parse_body(body)?;
    let payload = serde_json::to_value(&input)?;

    let outcome = apply_or_queue(
        &state,
        &user,
        OperationKind::Create,
        payload,
        || InvoiceService::precheck_create(&user, &input),
        state.invoices.create(&user, input.clone()),
    )
    .await?;

    Ok(outcome.respond(StatusCode::CREATED, "Invoice created"))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = state.invoices.get(&user, id).await?;
    let stats = invoice.stats(Utc::now());
    Ok(Json(ApiResponse::ok(InvoiceDetail { invoice, stats })))
}

async fn change_invoice(
    state: &AppState,
    user: &User,
    id: Uuid,
    change: InvoiceChange,
) -> Result<Response, AppError> {
    let message = past_tense(&change);
    let payload = serde_json::to_value(InvoiceUpdatePayload {
        id,
        change: change.clone(),
    })?;

    let op = async {
        match change.clone() {
            InvoiceChange::Pay(input) => state.invoices.pay(user, id, input).await,
            InvoiceChange::Withdraw { date } => state.invoices.withdraw(user, id, date).await,
            InvoiceChange::Cancel { reason } => state.invoices.cancel(user, id, &reason).await,
            InvoiceChange::Duplicate { new_id } => {
                state.invoices.duplicate(user, id, new_id).await
            }
            InvoiceChange::Update(patch) => state.invoices.update(user, id, patch).await,
        }
    };

    let outcome = apply_or_queue(
        state,
        user,
        OperationKind::Update,
        payload,
        || InvoiceService::precheck(user, &change),
        op,
    )
    .await?;

    Ok(outcome.respond(StatusCode::OK, message))
}

/// `POST /invoices/{id}`: `{ "action": "pay" | "withdraw" | "cancel" | "duplicate", ... }`.
pub async fn invoice_action(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let change: InvoiceChange = parse_body(body)?;
    if matches!(change, InvoiceChange::Update(_)) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Use PUT to update invoice fields"
        )));
    }
    change_invoice(&state, &user, id, change).await
}

pub async fn update_invoice_by_id(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let patch: UpdateInvoiceInput = parse_body(body)?;
    change_invoice(&state, &user, id, InvoiceChange::Update(patch)).await
}

pub async fn update_invoice(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let request: UpdateInvoiceRequest = parse_body(body)?;
    change_invoice(
        &state,
        &user,
        request.id,
        InvoiceChange::Update(request.patch),
    )
    .await
}

async fn remove_invoice(state: &AppState, user: &User, id: Uuid) -> Result<Response, AppError> {
    let payload = serde_json::to_value(TargetId { id })?;

    let outcome = apply_or_queue(
        state,
        user,
        OperationKind::Delete,
        payload,
        || InvoiceService::precheck_delete(user),
        state.invoices.delete(user, id),
    )
    .await?;

    Ok(outcome.respond(StatusCode::OK, "Invoice deleted"))
}

pub async fn delete_invoice_by_id(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    remove_invoice(&state, &user, id).await
}

/// `DELETE /invoices?id=...`
pub async fn delete_invoice(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<DeleteParams>,
) -> Result<Response, AppError> {
    let id = params.id.ok_or_else(|| {
        AppError::invalid_field("id", "required", "Invoice id is required")
    })?;
    remove_invoice(&state, &user, id).await
}
