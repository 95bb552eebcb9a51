use crate::dtos::{parse_body, ApiResponse, SearchBody, SearchHitResponse, SearchParams};
use crate::middleware::AuthUser;
use crate::services::search::SearchResults;
use crate::services::SearchRequest;
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use service_core::error::AppError;

fn respond(results: SearchResults) -> impl IntoResponse {
    let hits: Vec<SearchHitResponse> =
        results.hits.into_iter().map(SearchHitResponse::from).collect();
    Json(
        ApiResponse::ok(hits)
            .with_message(format!("Sorted by {}", results.sort.as_str()))
            .with_pagination(results.pagination),
    )
}

/// `POST /invoices/search`
pub async fn search_invoices(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let body: SearchBody = parse_body(body)?;
    let results = state
        .search
        .search(user.tenant_id, SearchRequest::from(body))
        .await?;
    Ok(respond(results))
}

/// `GET /invoices/search?q=...`
pub async fn search_invoices_query(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, AppError> {
    let results = state
        .search
        .search(user.tenant_id, SearchRequest::from(params))
        .await?;
    Ok(respond(results))
}
