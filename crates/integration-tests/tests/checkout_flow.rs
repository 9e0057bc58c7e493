//! End-to-end checkout: cart to delivered order through the public
//! engine services only.

use rust_decimal::Decimal;
use serde_json::json;
use stockroom_core::{OrderStatus, PaymentStatus};
use stockroom_engine::EngineError;
use stockroom_engine::config::EngineConfig;
use stockroom_engine::models::{CartLine, CheckoutCharges};
use stockroom_integration_tests::{TestContext, WAREHOUSE, deliver, on_hand, place, settle};

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn test_checkout_to_delivery() {
    let ctx = TestContext::new().await;

    let order = place(&ctx.engine, &ctx.seeded, 2).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Unpaid);
    assert_eq!(order.total, "20.00".parse::<Decimal>().unwrap());
    assert_eq!(on_hand(&ctx.engine, ctx.seeded.product.id).await, 8);

    let payment = settle(&ctx.engine, &order, "20.00").await;
    assert!(payment.provider_payment_id.is_some());

    deliver(&ctx.engine, order.id).await;

    let delivered = ctx
        .engine
        .orders()
        .order(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
    assert_eq!(delivered.payment_status, PaymentStatus::Paid);

    // The line item froze the catalog state at purchase time.
    let items = ctx.engine.orders().line_items(order.id).await.unwrap();
    assert_eq!(items.len(), 1);
    let item = items.first().unwrap();
    assert_eq!(item.sku.as_str(), "WIDGET-01");
    assert_eq!(item.unit_price, "10.00".parse::<Decimal>().unwrap());
    assert_eq!(item.quantity, 2);
}

#[tokio::test]
async fn test_charges_are_added_to_the_total() {
    let ctx = TestContext::new().await;

    let order = ctx
        .engine
        .orders()
        .place_order(
            ctx.seeded.customer.id,
            &[CartLine {
                product_id: ctx.seeded.product.id,
                warehouse_id: WAREHOUSE,
                quantity: 2,
            }],
            ctx.seeded.address.id,
            ctx.seeded.address.id,
            CheckoutCharges {
                shipping_cost: "3.00".parse().unwrap(),
                tax: "1.50".parse().unwrap(),
                currency: stockroom_core::CurrencyCode::USD,
            },
        )
        .await
        .unwrap();

    assert_eq!(order.subtotal, "20.00".parse::<Decimal>().unwrap());
    assert_eq!(order.total, "24.50".parse::<Decimal>().unwrap());
}

#[tokio::test]
async fn test_order_numbers_are_unique_and_resolvable() {
    let ctx = TestContext::new().await;

    let first = place(&ctx.engine, &ctx.seeded, 1).await;
    let second = place(&ctx.engine, &ctx.seeded, 1).await;
    assert_ne!(first.order_number, second.order_number);

    let found = ctx
        .engine
        .orders()
        .order_by_number(&second.order_number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, second.id);
}

// =============================================================================
// Payment Gates
// =============================================================================

#[tokio::test]
async fn test_unpaid_order_cannot_start_processing() {
    let ctx = TestContext::new().await;
    let order = place(&ctx.engine, &ctx.seeded, 1).await;

    let err = ctx
        .engine
        .lifecycle()
        .transition(order.id, OrderStatus::Processing)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_partial_payment_processes_when_configured() {
    let ctx = TestContext::with_config(EngineConfig {
        allow_partial_processing: true,
        ..EngineConfig::default()
    })
    .await;

    let order = place(&ctx.engine, &ctx.seeded, 2).await;
    settle(&ctx.engine, &order, "5.00").await;

    let updated = ctx
        .engine
        .lifecycle()
        .transition(order.id, OrderStatus::Processing)
        .await
        .unwrap();
    assert_eq!(updated.status, OrderStatus::Processing);
    assert_eq!(updated.payment_status, PaymentStatus::Partial);
}

#[tokio::test]
async fn test_cancellation_restocks() {
    let ctx = TestContext::new().await;
    let order = place(&ctx.engine, &ctx.seeded, 3).await;
    assert_eq!(on_hand(&ctx.engine, ctx.seeded.product.id).await, 7);

    let cancelled = ctx
        .engine
        .lifecycle()
        .transition(order.id, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(on_hand(&ctx.engine, ctx.seeded.product.id).await, 10);
}

// =============================================================================
// Activity Trail
// =============================================================================

#[tokio::test]
async fn test_checkout_leaves_an_activity_trail() {
    let ctx = TestContext::new().await;
    let order = place(&ctx.engine, &ctx.seeded, 1).await;
    settle(&ctx.engine, &order, "10.00").await;

    let events = ctx.activity.snapshot();
    let placed = events
        .iter()
        .find(|e| e.entity_type == "order" && e.action == "placed")
        .expect("order placement must be recorded");
    assert_eq!(
        placed.payload,
        json!({
            "order_number": order.order_number,
            "customer_id": order.customer_id,
            "total": order.total,
            "currency": order.currency,
            "display_total": order.display_total(),
        })
    );

    assert!(
        events
            .iter()
            .any(|e| e.entity_type == "payment" && e.action == "settled"),
        "payment settlement must be recorded"
    );
    assert!(
        events
            .iter()
            .any(|e| e.entity_type == "reservation" && e.action == "reserved"),
        "stock reservation must be recorded"
    );
}
