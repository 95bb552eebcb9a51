//! Invoice lifecycle integration tests: create, pay, withdraw, cancel,
//! duplicate, update and delete against the in-memory store.

mod common;

use async_trait::async_trait;
use common::{create_input, item, TestApp};
use factures_service::models::{
    Discount, Invoice, InvoicePage, InvoiceQuery, InvoiceStatus, LifecycleState, OperationKind,
    PayInput, PaymentMethod, Resource, UpdateInvoiceInput, User,
};
use factures_service::services::invoices::DELETE_REASON;
use factures_service::services::{DataStore, InvoiceError, InvoiceService, MemoryStore};
use rust_decimal::Decimal;
use serde_json::Value;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn cash() -> PayInput {
    PayInput {
        method: Some("cash".to_string()),
        date: None,
    }
}

#[tokio::test]
async fn full_lifecycle_from_create_to_withdrawal() {
    // Arrange
    let app = TestApp::spawn();
    let clerk = &app.staff.clerk;

    // Act
    let invoice = app
        .invoices()
        .create(clerk, create_input("Aminata Diallo"))
        .await
        .expect("Failed to create invoice");

    // Assert
    assert_eq!(invoice.number, "FAC-000001");
    assert_eq!(invoice.subtotal, Decimal::from(5000));
    assert_eq!(invoice.discount_amount, Decimal::from(500));
    assert_eq!(invoice.total, Decimal::from(4500));
    assert_eq!(invoice.status, InvoiceStatus::Active);
    assert!(!invoice.paid);
    assert!(!invoice.withdrawn);
    assert_eq!(invoice.created_by, clerk.id);
    assert_eq!(invoice.created_by_name, "Fatou");

    let paid = app
        .invoices()
        .pay(clerk, invoice.id, cash())
        .await
        .expect("Failed to pay");
    assert!(paid.paid);
    assert_eq!(paid.payment_method, Some(PaymentMethod::Cash));
    assert!(paid.payment_date.is_some());
    assert_eq!(paid.modified_by, Some(clerk.id));

    let withdrawn = app
        .invoices()
        .withdraw(clerk, invoice.id, None)
        .await
        .expect("Failed to withdraw");
    assert!(withdrawn.withdrawn);
    assert!(withdrawn.withdrawal_date.is_some());

    let again = app.invoices().withdraw(clerk, invoice.id, None).await;
    assert!(matches!(again, Err(InvoiceError::AlreadyWithdrawn)));
}

#[tokio::test]
async fn numbers_increase_per_tenant() {
    let app = TestApp::spawn();
    let first = app.seed_invoice(&app.staff.clerk, "Awa").await;
    let second = app.seed_invoice(&app.staff.clerk, "Binta").await;
    assert_eq!(first.number, "FAC-000001");
    assert_eq!(second.number, "FAC-000002");
}

#[tokio::test]
async fn percentage_discount_and_tax_are_applied() {
    let app = TestApp::spawn();
    let mut input = create_input("Cheikh");
    input.discount = Some(Discount::Percentage(Decimal::from(10)));
    input.tax = Some(Decimal::from(90));

    let invoice = app
        .invoices()
        .create(&app.staff.clerk, input)
        .await
        .expect("Failed to create invoice");

    assert_eq!(invoice.discount_amount, Decimal::from(500));
    assert_eq!(invoice.total, Decimal::from(4590));
}

#[tokio::test]
async fn create_rejects_invalid_input_with_field_details() {
    let app = TestApp::spawn();
    let mut input = create_input("");
    input.items.clear();
    input.deposit_date = None;

    let err = app
        .invoices()
        .create(&app.staff.clerk, input)
        .await
        .expect_err("Invalid input must be rejected");

    match err {
        InvoiceError::Validation(errors) => {
            let fields = errors.field_errors();
            assert!(fields.contains_key("client_name"));
            assert!(fields.contains_key("items"));
            assert!(fields.contains_key("deposit_date"));
        }
        other => panic!("Expected validation error, got {:?}", other),
    }
    assert_eq!(app.store.invoice_count(app.staff.tenant_id), 0);
}

#[tokio::test]
async fn blank_client_name_is_rejected_on_create_and_update() {
    let app = TestApp::spawn();
    let clerk = &app.staff.clerk;

    let created = app.invoices().create(clerk, create_input("   ")).await;
    match created {
        Err(InvoiceError::Validation(errors)) => {
            assert!(errors.field_errors().contains_key("client_name"));
        }
        other => panic!("Expected validation error, got {:?}", other),
    }
    assert_eq!(app.store.invoice_count(app.staff.tenant_id), 0);

    let invoice = app.seed_invoice(clerk, "Awa").await;
    let patch = UpdateInvoiceInput {
        client_name: Some("  \t ".to_string()),
        ..Default::default()
    };
    let updated = app.invoices().update(clerk, invoice.id, patch).await;
    assert!(matches!(updated, Err(InvoiceError::Validation(_))));

    let stored = app.invoices().get(clerk, invoice.id).await.unwrap();
    assert_eq!(stored.client_name, "Awa");
}

#[tokio::test]
async fn create_rejects_discount_above_subtotal() {
    let app = TestApp::spawn();
    let mut input = create_input("Awa");
    input.discount = Some(Discount::Amount(Decimal::from(6000)));

    let err = app.invoices().create(&app.staff.clerk, input).await;
    assert!(matches!(err, Err(InvoiceError::Validation(_))));
}

#[tokio::test]
async fn create_requires_grant() {
    let app = TestApp::spawn();
    let err = app
        .invoices()
        .create(&app.staff.trainee, create_input("Awa"))
        .await;
    assert!(matches!(err, Err(InvoiceError::PermissionDenied("create"))));
}

#[tokio::test]
async fn create_with_known_id_is_idempotent() {
    let app = TestApp::spawn();
    let mut input = create_input("Awa");
    input.id = Some(Uuid::new_v4());

    let first = app
        .invoices()
        .create(&app.staff.clerk, input.clone())
        .await
        .expect("Failed to create invoice");
    let second = app
        .invoices()
        .create(&app.staff.clerk, input)
        .await
        .expect("Repeated create must succeed");

    assert_eq!(first.id, second.id);
    assert_eq!(first.number, second.number);
    assert_eq!(app.store.invoice_count(app.staff.tenant_id), 1);
}

#[tokio::test]
async fn numbering_failure_aborts_create() {
    let app = TestApp::spawn();
    app.store.set_numbering_available(false);

    let err = app
        .invoices()
        .create(&app.staff.clerk, create_input("Awa"))
        .await;

    assert!(matches!(err, Err(InvoiceError::Dependency(_))));
    assert_eq!(app.store.invoice_count(app.staff.tenant_id), 0);
}

#[tokio::test]
async fn pay_requires_known_method() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.clerk, "Awa").await;

    let missing = app
        .invoices()
        .pay(&app.staff.clerk, invoice.id, PayInput::default())
        .await;
    assert!(matches!(missing, Err(InvoiceError::Validation(_))));

    let unknown = app
        .invoices()
        .pay(
            &app.staff.clerk,
            invoice.id,
            PayInput {
                method: Some("barter".to_string()),
                date: None,
            },
        )
        .await;
    assert!(matches!(unknown, Err(InvoiceError::Validation(_))));
}

#[tokio::test]
async fn pay_twice_is_a_conflict() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.clerk, "Awa").await;

    app.invoices()
        .pay(&app.staff.clerk, invoice.id, cash())
        .await
        .expect("Failed to pay");
    let again = app.invoices().pay(&app.staff.clerk, invoice.id, cash()).await;

    assert!(matches!(again, Err(InvoiceError::AlreadyPaid)));
}

#[tokio::test]
async fn withdraw_requires_payment() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.clerk, "Awa").await;

    let err = app.invoices().withdraw(&app.staff.clerk, invoice.id, None).await;
    assert!(matches!(err, Err(InvoiceError::NotPaid)));

    let stored = app
        .invoices()
        .get(&app.staff.clerk, invoice.id)
        .await
        .expect("Failed to load invoice");
    assert!(!stored.withdrawn);
}

#[tokio::test]
async fn unknown_invoice_is_not_found() {
    let app = TestApp::spawn();
    let err = app
        .invoices()
        .pay(&app.staff.clerk, Uuid::new_v4(), cash())
        .await;
    assert!(matches!(err, Err(InvoiceError::NotFound)));
}

#[tokio::test]
async fn invoices_are_isolated_per_tenant() {
    let app = TestApp::spawn();
    let other = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.clerk, "Awa").await;

    // Same store, different tenant.
    app.store.put_user(other.staff.owner.clone());
    let err = app.invoices().get(&other.staff.owner, invoice.id).await;
    assert!(matches!(err, Err(InvoiceError::NotFound)));
}

#[tokio::test]
async fn cancel_requires_reason() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.clerk, "Awa").await;

    let err = app
        .invoices()
        .cancel(&app.staff.manager, invoice.id, "  ")
        .await;

    assert!(matches!(err, Err(InvoiceError::Validation(_))));
}

#[tokio::test]
async fn cancel_needs_grant_or_authorship() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.manager, "Awa").await;

    let denied = app
        .invoices()
        .cancel(&app.staff.clerk, invoice.id, "Client changed mind")
        .await;
    assert!(matches!(denied, Err(InvoiceError::PermissionDenied("cancel"))));

    let own = app.seed_invoice(&app.staff.clerk, "Binta").await;
    let cancelled = app
        .invoices()
        .cancel(&app.staff.clerk, own.id, "Duplicate entry")
        .await
        .expect("Creator may cancel");
    assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("Duplicate entry"));
    assert_eq!(cancelled.cancelled_by, Some(app.staff.clerk.id));
    assert!(cancelled.cancelled_at.is_some());
}

#[tokio::test]
async fn cancelled_invoice_is_terminal() {
    let app = TestApp::spawn();
    let clerk = &app.staff.clerk;
    let invoice = app.seed_invoice(clerk, "Awa").await;
    let cancelled = app
        .invoices()
        .cancel(clerk, invoice.id, "Wrong client")
        .await
        .expect("Failed to cancel");

    assert!(matches!(
        app.invoices().pay(clerk, invoice.id, cash()).await,
        Err(InvoiceError::Cancelled)
    ));
    assert!(matches!(
        app.invoices().withdraw(clerk, invoice.id, None).await,
        Err(InvoiceError::Cancelled)
    ));
    assert!(matches!(
        app.invoices().cancel(clerk, invoice.id, "Again").await,
        Err(InvoiceError::AlreadyCancelled)
    ));
    let patch = UpdateInvoiceInput {
        notes: Some("Late edit".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        app.invoices().update(clerk, invoice.id, patch).await,
        Err(InvoiceError::NotModifiable)
    ));

    let stored = app
        .invoices()
        .get(clerk, invoice.id)
        .await
        .expect("Failed to load invoice");
    assert_eq!(stored, cancelled);
}

#[tokio::test]
async fn owner_may_annotate_cancelled_invoice_but_not_reprice_it() {
    let app = TestApp::spawn();
    let owner = &app.staff.owner;
    let invoice = app.seed_invoice(&app.staff.clerk, "Awa").await;
    app.invoices()
        .cancel(owner, invoice.id, "Wrong client")
        .await
        .expect("Failed to cancel");

    let annotated = app
        .invoices()
        .update(
            owner,
            invoice.id,
            UpdateInvoiceInput {
                notes: Some("Refunded at counter".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("Owner may edit notes");
    assert_eq!(annotated.notes.as_deref(), Some("Refunded at counter"));
    assert_eq!(annotated.status, InvoiceStatus::Cancelled);

    let repriced = app
        .invoices()
        .update(
            owner,
            invoice.id,
            UpdateInvoiceInput {
                tax: Some(Decimal::from(100)),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(repriced, Err(InvoiceError::NotModifiable)));
}

#[tokio::test]
async fn update_with_items_recomputes_totals() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.clerk, "Awa").await;

    let updated = app
        .invoices()
        .update(
            &app.staff.clerk,
            invoice.id,
            UpdateInvoiceInput {
                items: Some(vec![item(4, 1500)]),
                ..Default::default()
            },
        )
        .await
        .expect("Failed to update");

    assert_eq!(updated.items.len(), 1);
    assert_eq!(updated.items[0].total, Decimal::from(6000));
    assert_eq!(updated.subtotal, Decimal::from(6000));
    // Stored amount discount still applies.
    assert_eq!(updated.total, Decimal::from(5500));
    assert_eq!(updated.number, invoice.number);
}

#[tokio::test]
async fn update_by_unrelated_employee_is_denied() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.manager, "Awa").await;

    let err = app
        .invoices()
        .update(
            &app.staff.clerk,
            invoice.id,
            UpdateInvoiceInput {
                notes: Some("Mine now".to_string()),
                ..Default::default()
            },
        )
        .await;

    assert!(matches!(err, Err(InvoiceError::PermissionDenied("update"))));
}

#[tokio::test]
async fn duplicate_resets_lifecycle_and_links_source() {
    let app = TestApp::spawn();
    let clerk = &app.staff.clerk;
    let source = app.seed_invoice(clerk, "Awa").await;
    app.invoices().pay(clerk, source.id, cash()).await.expect("Failed to pay");
    app.invoices()
        .withdraw(clerk, source.id, None)
        .await
        .expect("Failed to withdraw");

    let copy = app
        .invoices()
        .duplicate(clerk, source.id, None)
        .await
        .expect("Failed to duplicate");

    assert_ne!(copy.id, source.id);
    assert_ne!(copy.number, source.number);
    assert!(!copy.paid);
    assert!(!copy.withdrawn);
    assert_eq!(copy.status, InvoiceStatus::Active);
    assert!(copy.payment_method.is_none());
    assert_eq!(copy.source_invoice_id, Some(source.id));
    assert_eq!(copy.total, source.total);
    assert_eq!(copy.client_name, source.client_name);
    assert!(copy
        .notes
        .as_deref()
        .is_some_and(|notes| notes.starts_with(&format!("Duplicata de {}", source.number))));
}

#[tokio::test]
async fn duplicate_of_cancelled_invoice_is_active() {
    let app = TestApp::spawn();
    let source = app.seed_invoice(&app.staff.manager, "Awa").await;
    app.invoices()
        .cancel(&app.staff.manager, source.id, "Wrong items")
        .await
        .expect("Failed to cancel");

    let copy = app
        .invoices()
        .duplicate(&app.staff.manager, source.id, None)
        .await
        .expect("Failed to duplicate");

    assert_eq!(copy.status, InvoiceStatus::Active);
    assert!(copy.cancellation_reason.is_none());
}

#[tokio::test]
async fn delete_is_owner_only_soft_cancel() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.manager, "Awa").await;

    let denied = app.invoices().delete(&app.staff.manager, invoice.id).await;
    assert!(matches!(denied, Err(InvoiceError::PermissionDenied("delete"))));

    let deleted = app
        .invoices()
        .delete(&app.staff.owner, invoice.id)
        .await
        .expect("Owner may delete");
    assert_eq!(deleted.status, InvoiceStatus::Cancelled);
    assert_eq!(deleted.cancellation_reason.as_deref(), Some(DELETE_REASON));
    assert_eq!(app.store.invoice_count(app.staff.tenant_id), 1);
}

#[tokio::test]
async fn client_statistics_follow_visits_and_payments() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.clerk, "Awa").await;
    app.invoices()
        .pay(&app.staff.clerk, invoice.id, cash())
        .await
        .expect("Failed to pay");

    let phone = invoice.client_phone.clone().expect("Seed has a phone");
    let mut totals = None;
    for _ in 0..50 {
        totals = app
            .store
            .client_totals(app.staff.tenant_id, &phone)
            .filter(|t| t.total_spent == Decimal::from(4500) && t.visit_count == 1);
        if totals.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let totals = totals.expect("Client statistics were not updated");
    assert_eq!(totals.visit_count, 1);
    assert_eq!(totals.name, "Awa");
}

#[tokio::test]
async fn client_statistics_failure_does_not_fail_create() {
    let app = TestApp::spawn();
    app.store.set_stats_available(false);

    let invoice = app
        .invoices()
        .create(&app.staff.clerk, create_input("Awa"))
        .await
        .expect("Create must succeed without statistics");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(app
        .store
        .client_totals(app.staff.tenant_id, invoice.client_phone.as_deref().unwrap_or_default())
        .is_none());
}

/// Lets a card payment from another writer land between each load and save.
struct CompetingPayment {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl DataStore for CompetingPayment {
    async fn health_check(&self) -> Result<(), AppError> {
        self.inner.health_check().await
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        self.inner.get_user(user_id).await
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        self.inner.insert_invoice(invoice).await
    }

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.get_invoice(tenant_id, invoice_id).await
    }

    async fn save_invoice(
        &self,
        invoice: &Invoice,
        expected: LifecycleState,
    ) -> Result<Invoice, AppError> {
        if let Some(mut current) = self.inner.get_invoice(invoice.tenant_id, invoice.id).await? {
            if !current.paid {
                let before = current.lifecycle();
                current.paid = true;
                current.payment_method = Some(PaymentMethod::Card);
                self.inner.save_invoice(&current, before).await?;
            }
        }
        self.inner.save_invoice(invoice, expected).await
    }

    async fn query_invoices(
        &self,
        tenant_id: Uuid,
        query: &InvoiceQuery,
    ) -> Result<InvoicePage, AppError> {
        self.inner.query_invoices(tenant_id, query).await
    }

    async fn apply_mutation(
        &self,
        tenant_id: Uuid,
        resource: Resource,
        kind: OperationKind,
        payload: &Value,
    ) -> Result<(), AppError> {
        self.inner.apply_mutation(tenant_id, resource, kind, payload).await
    }
}

#[tokio::test]
async fn save_with_stale_lifecycle_is_rejected() {
    let app = TestApp::spawn();
    let invoice = app.seed_invoice(&app.staff.clerk, "Awa").await;
    let stale = invoice.lifecycle();
    app.invoices()
        .pay(&app.staff.clerk, invoice.id, cash())
        .await
        .expect("Failed to pay");

    let mut late = invoice.clone();
    late.notes = Some("late write".to_string());
    let result = app.store.save_invoice(&late, stale).await;

    assert!(matches!(result, Err(AppError::Conflict(_))));
    let stored = app.invoices().get(&app.staff.clerk, invoice.id).await.unwrap();
    assert!(stored.paid);
    assert_eq!(stored.notes, invoice.notes);
}

#[tokio::test]
async fn payment_losing_a_race_reports_already_paid() {
    // Arrange
    let app = TestApp::spawn();
    let clerk = &app.staff.clerk;
    let invoice = app.seed_invoice(clerk, "Awa").await;
    let racing = InvoiceService::new(
        Arc::new(CompetingPayment {
            inner: Arc::clone(&app.store),
        }),
        app.store.clone(),
        app.store.clone(),
    );

    // Act
    let result = racing.pay(clerk, invoice.id, cash()).await;

    // Assert
    assert!(matches!(result, Err(InvoiceError::AlreadyPaid)));
    let stored = app.invoices().get(clerk, invoice.id).await.unwrap();
    assert!(stored.paid);
    assert_eq!(stored.payment_method, Some(PaymentMethod::Card));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let phone = invoice.client_phone.clone().expect("Seed has a phone");
    let spent = app
        .store
        .client_totals(app.staff.tenant_id, &phone)
        .map(|t| t.total_spent)
        .unwrap_or_default();
    assert_eq!(spent, Decimal::ZERO);
}
