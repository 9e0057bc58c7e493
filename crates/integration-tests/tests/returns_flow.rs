//! Returns end to end: eligibility policy, quantity accounting, and the
//! restock-plus-refund completion.

use rust_decimal::Decimal;
use stockroom_core::{OrderStatus, PaymentAttemptStatus, PaymentStatus, ReturnStatus};
use stockroom_engine::EngineError;
use stockroom_engine::config::{EngineConfig, ReturnPolicy};
use stockroom_engine::models::{NewReturn, Order, ReturnLine};
use stockroom_integration_tests::{TestContext, deliver, on_hand, place, settle};

async fn delivered_order(ctx: &TestContext, quantity: u32) -> (Order, NewReturn) {
    let order = place(&ctx.engine, &ctx.seeded, quantity).await;
    settle(&ctx.engine, &order, &order.total.to_string()).await;
    deliver(&ctx.engine, order.id).await;

    let items = ctx.engine.orders().line_items(order.id).await.unwrap();
    let request = NewReturn {
        order_id: order.id,
        reason: "does not fit".to_string(),
        lines: vec![ReturnLine {
            line_item_id: items.first().unwrap().id,
            quantity: 1,
        }],
    };
    (order, request)
}

// =============================================================================
// Return to Refund
// =============================================================================

#[tokio::test]
async fn test_return_to_refund_flow() {
    let ctx = TestContext::new().await;
    let (order, request) = delivered_order(&ctx, 2).await;
    assert_eq!(on_hand(&ctx.engine, ctx.seeded.product.id).await, 8);

    let opened = ctx.engine.returns().open(request).await.unwrap();
    assert_eq!(opened.status, ReturnStatus::Requested);

    ctx.engine.returns().approve(opened.id).await.unwrap();
    let completed = ctx.engine.returns().complete(opened.id).await.unwrap();

    assert_eq!(completed.status, ReturnStatus::Completed);
    assert_eq!(
        completed.refund_amount,
        Some("10.00".parse::<Decimal>().unwrap())
    );
    assert_eq!(on_hand(&ctx.engine, ctx.seeded.product.id).await, 9);

    // Whole payments are refunded, so the single 20.00 settlement flips
    // even though only 10.00 worth of goods came back.
    let payments = ctx.engine.payments().payments_for_order(order.id).await.unwrap();
    assert_eq!(payments.first().unwrap().status, PaymentAttemptStatus::Refunded);

    let updated = ctx.engine.orders().order(order.id).await.unwrap().unwrap();
    assert_eq!(updated.payment_status, PaymentStatus::Refunded);
    // Fulfillment history is preserved unless the refund policy says
    // otherwise.
    assert_eq!(updated.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn test_refund_policy_moves_the_order() {
    let ctx = TestContext::with_config(EngineConfig {
        refund_sets_order_status: true,
        ..EngineConfig::default()
    })
    .await;
    let (order, _) = delivered_order(&ctx, 2).await;

    let items = ctx.engine.orders().line_items(order.id).await.unwrap();
    let opened = ctx
        .engine
        .returns()
        .open(NewReturn {
            order_id: order.id,
            reason: "changed my mind".to_string(),
            lines: vec![ReturnLine {
                line_item_id: items.first().unwrap().id,
                quantity: 2,
            }],
        })
        .await
        .unwrap();
    ctx.engine.returns().approve(opened.id).await.unwrap();
    ctx.engine.returns().complete(opened.id).await.unwrap();

    let updated = ctx.engine.orders().order(order.id).await.unwrap().unwrap();
    assert_eq!(updated.payment_status, PaymentStatus::Refunded);
    assert_eq!(updated.status, OrderStatus::Refunded);
    assert_eq!(on_hand(&ctx.engine, ctx.seeded.product.id).await, 10);
}

// =============================================================================
// Eligibility Policy
// =============================================================================

#[tokio::test]
async fn test_returns_require_delivery_by_default() {
    let ctx = TestContext::new().await;
    let order = place(&ctx.engine, &ctx.seeded, 1).await;
    settle(&ctx.engine, &order, "10.00").await;
    ctx.engine
        .lifecycle()
        .transition(order.id, OrderStatus::Processing)
        .await
        .unwrap();
    ctx.engine
        .lifecycle()
        .transition(order.id, OrderStatus::Shipped)
        .await
        .unwrap();

    let items = ctx.engine.orders().line_items(order.id).await.unwrap();
    let err = ctx
        .engine
        .returns()
        .open(NewReturn {
            order_id: order.id,
            reason: "arrived early".to_string(),
            lines: vec![ReturnLine {
                line_item_id: items.first().unwrap().id,
                quantity: 1,
            }],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_shipped_or_delivered_policy_accepts_in_transit_returns() {
    let ctx = TestContext::with_config(EngineConfig {
        return_policy: ReturnPolicy::ShippedOrDelivered,
        ..EngineConfig::default()
    })
    .await;
    let order = place(&ctx.engine, &ctx.seeded, 1).await;
    settle(&ctx.engine, &order, "10.00").await;
    ctx.engine
        .lifecycle()
        .transition(order.id, OrderStatus::Processing)
        .await
        .unwrap();
    ctx.engine
        .lifecycle()
        .transition(order.id, OrderStatus::Shipped)
        .await
        .unwrap();

    let items = ctx.engine.orders().line_items(order.id).await.unwrap();
    let opened = ctx
        .engine
        .returns()
        .open(NewReturn {
            order_id: order.id,
            reason: "refused at door".to_string(),
            lines: vec![ReturnLine {
                line_item_id: items.first().unwrap().id,
                quantity: 1,
            }],
        })
        .await
        .unwrap();
    assert_eq!(opened.status, ReturnStatus::Requested);
}

#[tokio::test]
async fn test_open_return_blocks_delivery_until_resolved() {
    let ctx = TestContext::with_config(EngineConfig {
        return_policy: ReturnPolicy::ShippedOrDelivered,
        ..EngineConfig::default()
    })
    .await;
    let order = place(&ctx.engine, &ctx.seeded, 1).await;
    settle(&ctx.engine, &order, "10.00").await;
    ctx.engine
        .lifecycle()
        .transition(order.id, OrderStatus::Processing)
        .await
        .unwrap();
    ctx.engine
        .lifecycle()
        .transition(order.id, OrderStatus::Shipped)
        .await
        .unwrap();

    let items = ctx.engine.orders().line_items(order.id).await.unwrap();
    let opened = ctx
        .engine
        .returns()
        .open(NewReturn {
            order_id: order.id,
            reason: "refused at door".to_string(),
            lines: vec![ReturnLine {
                line_item_id: items.first().unwrap().id,
                quantity: 1,
            }],
        })
        .await
        .unwrap();

    let err = ctx
        .engine
        .lifecycle()
        .transition(order.id, OrderStatus::Delivered)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    ctx.engine.returns().reject(opened.id).await.unwrap();
    let updated = ctx
        .engine
        .lifecycle()
        .transition(order.id, OrderStatus::Delivered)
        .await
        .unwrap();
    assert_eq!(updated.status, OrderStatus::Delivered);
}

// =============================================================================
// Quantity Accounting
// =============================================================================

#[tokio::test]
async fn test_returns_cannot_exceed_purchased_quantity() {
    let ctx = TestContext::new().await;
    let (order, request) = delivered_order(&ctx, 2).await;

    ctx.engine.returns().open(request).await.unwrap();

    let items = ctx.engine.orders().line_items(order.id).await.unwrap();
    let err = ctx
        .engine
        .returns()
        .open(NewReturn {
            order_id: order.id,
            reason: "second thoughts".to_string(),
            lines: vec![ReturnLine {
                line_item_id: items.first().unwrap().id,
                quantity: 2,
            }],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_rejected_return_frees_its_quantity() {
    let ctx = TestContext::new().await;
    let (order, request) = delivered_order(&ctx, 1).await;

    let first = ctx.engine.returns().open(request.clone()).await.unwrap();

    // The unit is spoken for while the request is pending.
    let err = ctx.engine.returns().open(request.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    ctx.engine.returns().reject(first.id).await.unwrap();
    let reopened = ctx.engine.returns().open(request).await.unwrap();
    assert_eq!(reopened.order_id, order.id);
}
