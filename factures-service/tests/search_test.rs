//! Search integration tests: relevance ranking, sorted listing, filters
//! and pagination over the in-memory store.

mod common;

use common::{create_input, item, TestApp};
use factures_service::models::{
    Invoice, InvoiceFilters, PayInput, SortField, SortOrder, MAX_PAGE_SIZE,
};
use factures_service::services::SearchRequest;
use rust_decimal::Decimal;

async fn seed(app: &TestApp, client_name: &str) -> Invoice {
    app.seed_invoice(&app.staff.clerk, client_name).await
}

fn term(raw: &str) -> SearchRequest {
    SearchRequest {
        term: Some(raw.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn exact_number_ranks_first() {
    // Arrange
    let app = TestApp::spawn();
    seed(&app, "Awa").await;
    let target = seed(&app, "Binta").await;
    seed(&app, "Coumba").await;

    // Act
    let results = app
        .state
        .search
        .search(app.staff.tenant_id, term(&target.number.to_lowercase()))
        .await
        .expect("Search failed");

    // Assert
    assert_eq!(results.sort, SortField::Relevance);
    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].invoice.id, target.id);
    // exact number + recent + active + unpaid
    assert_eq!(results.hits[0].score, Some(100 + 10 + 10 + 15));
}

#[tokio::test]
async fn exact_client_name_beats_partial() {
    let app = TestApp::spawn();
    let partial = seed(&app, "Awa Ndiaye").await;
    let exact = seed(&app, "Awa").await;

    let results = app
        .state
        .search
        .search(app.staff.tenant_id, term("AWA"))
        .await
        .expect("Search failed");

    let ids: Vec<_> = results.hits.iter().map(|h| h.invoice.id).collect();
    assert_eq!(ids, vec![exact.id, partial.id]);
    assert!(results.hits[0].score > results.hits[1].score);
}

#[tokio::test]
async fn tag_marker_searches_tags_only() {
    let app = TestApp::spawn();
    let mut input = create_input("Mariama");
    input.tags = vec!["Express".to_string()];
    let tagged = app
        .invoices()
        .create(&app.staff.clerk, input)
        .await
        .expect("Failed to create invoice");
    let mut noted = create_input("Express Pressing");
    noted.notes = Some("express".to_string());
    app.invoices()
        .create(&app.staff.clerk, noted)
        .await
        .expect("Failed to create invoice");

    let results = app
        .state
        .search
        .search(app.staff.tenant_id, term("#express"))
        .await
        .expect("Search failed");

    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].invoice.id, tagged.id);
}

#[tokio::test]
async fn numeric_term_matches_amounts() {
    let app = TestApp::spawn();
    seed(&app, "Awa").await;
    let mut input = create_input("Binta");
    input.items = vec![item(1, 1200)];
    input.discount = None;
    let small = app
        .invoices()
        .create(&app.staff.clerk, input)
        .await
        .expect("Failed to create invoice");

    let results = app
        .state
        .search
        .search(app.staff.tenant_id, term("1200"))
        .await
        .expect("Search failed");

    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].invoice.id, small.id);
    assert_eq!(results.hits[0].invoice.total, Decimal::from(1200));
}

#[tokio::test]
async fn relevance_without_term_falls_back_to_date() {
    let app = TestApp::spawn();
    let older = seed(&app, "Awa").await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let newer = seed(&app, "Binta").await;

    let results = app
        .state
        .search
        .search(
            app.staff.tenant_id,
            SearchRequest {
                term: Some("   ".to_string()),
                sort: Some(SortField::Relevance),
                ..Default::default()
            },
        )
        .await
        .expect("Search failed");

    assert_eq!(results.sort, SortField::Date);
    let ids: Vec<_> = results.hits.iter().map(|h| h.invoice.id).collect();
    assert_eq!(ids, vec![newer.id, older.id]);
    assert!(results.hits.iter().all(|h| h.score.is_none()));
}

#[tokio::test]
async fn amount_sort_pages_through_results() {
    let app = TestApp::spawn();
    for quantity in 1..=25 {
        let mut input = create_input(&format!("Client {}", quantity));
        input.items = vec![item(quantity, 100)];
        input.discount = None;
        app.invoices()
            .create(&app.staff.clerk, input)
            .await
            .expect("Failed to create invoice");
    }

    let results = app
        .state
        .search
        .search(
            app.staff.tenant_id,
            SearchRequest {
                sort: Some(SortField::Amount),
                order: Some(SortOrder::Asc),
                page: Some(3),
                limit: Some(10),
                ..Default::default()
            },
        )
        .await
        .expect("Search failed");

    assert_eq!(results.hits.len(), 5);
    assert_eq!(results.hits[0].invoice.total, Decimal::from(2100));
    assert_eq!(results.hits[4].invoice.total, Decimal::from(2500));
    assert_eq!(results.pagination.total, 25);
    assert_eq!(results.pagination.total_pages, 3);
    assert!(!results.pagination.has_next);
    assert!(results.pagination.has_prev);
}

#[tokio::test]
async fn filters_restrict_candidates() {
    let app = TestApp::spawn();
    let paid = seed(&app, "Awa").await;
    seed(&app, "Awa Sow").await;
    app.invoices()
        .pay(
            &app.staff.clerk,
            paid.id,
            PayInput {
                method: Some("card".to_string()),
                date: None,
            },
        )
        .await
        .expect("Failed to pay");

    let results = app
        .state
        .search
        .search(
            app.staff.tenant_id,
            SearchRequest {
                term: Some("awa".to_string()),
                filters: InvoiceFilters {
                    paid: Some(true),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .expect("Search failed");

    assert_eq!(results.pagination.total, 1);
    assert_eq!(results.hits[0].invoice.id, paid.id);
}

#[tokio::test]
async fn search_is_scoped_to_tenant() {
    let app = TestApp::spawn();
    seed(&app, "Awa").await;

    let results = app
        .state
        .search
        .search(uuid::Uuid::new_v4(), term("awa"))
        .await
        .expect("Search failed");

    assert!(results.hits.is_empty());
    assert_eq!(results.pagination.total, 0);
}

#[tokio::test]
async fn oversized_limit_is_clamped() {
    let app = TestApp::spawn();
    seed(&app, "Awa").await;

    let results = app
        .state
        .search
        .search(
            app.staff.tenant_id,
            SearchRequest {
                limit: Some(10_000),
                page: Some(-4),
                ..Default::default()
            },
        )
        .await
        .expect("Search failed");

    assert_eq!(results.pagination.limit, MAX_PAGE_SIZE);
    assert_eq!(results.pagination.page, 1);
}
