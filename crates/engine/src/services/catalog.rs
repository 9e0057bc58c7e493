//! Product catalog service.
//!
//! Owns products, the category tree, and reviews. Category re-parenting
//! runs under a single tree-wide mutex so two concurrent moves cannot
//! weave a cycle past the ancestor check.

use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use stockroom_core::{CategoryId, ProductId, Sku};
use tracing::{info, instrument};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::error::EngineError;
use crate::models::{Category, NewCategory, NewProduct, NewReview, Product, Review};
use crate::store::{Store, StoreError};

/// Product catalog service.
pub struct CatalogService<S> {
    store: Arc<S>,
    activity: Arc<dyn ActivityLog>,
    tree_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<S> Clone for CatalogService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            activity: Arc::clone(&self.activity),
            tree_lock: Arc::clone(&self.tree_lock),
        }
    }
}

impl<S: Store> CatalogService<S> {
    pub(crate) fn new(store: Arc<S>, activity: Arc<dyn ActivityLog>) -> Self {
        Self {
            store,
            activity,
            tree_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Register a product.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the name is blank, the price
    /// is negative, the image set has anything other than exactly one
    /// primary, or a supplier or tag repeats;
    /// [`EngineError::NotFound`] if the category does not exist;
    /// [`EngineError::Conflict`] if the SKU is taken; or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self, new), fields(sku = %new.sku))]
    pub async fn register_product(&self, new: NewProduct) -> Result<Product, EngineError> {
        if new.name.trim().is_empty() {
            return Err(EngineError::validation("product name cannot be empty"));
        }
        if new.price < Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "product price cannot be negative: {}",
                new.price
            )));
        }
        if !new.images.is_empty() {
            let primaries = new.images.iter().filter(|i| i.primary).count();
            if primaries != 1 {
                return Err(EngineError::validation(format!(
                    "product images must have exactly one primary, found {primaries}"
                )));
            }
        }

        let mut seen_suppliers = HashSet::new();
        for link in &new.suppliers {
            if !seen_suppliers.insert(link.supplier_id) {
                return Err(EngineError::validation(format!(
                    "duplicate supplier {} on product",
                    link.supplier_id
                )));
            }
        }
        let mut seen_tags = HashSet::new();
        for tag in &new.tags {
            if !seen_tags.insert(*tag) {
                return Err(EngineError::validation(format!(
                    "duplicate tag {tag} on product"
                )));
            }
        }

        if let Some(category_id) = new.category_id
            && self.store.category(category_id).await?.is_none()
        {
            return Err(EngineError::not_found("category", category_id));
        }

        let product = match self.store.insert_product(new).await {
            Ok(product) => product,
            Err(StoreError::Conflict(message)) => return Err(EngineError::conflict(message)),
            Err(e) => return Err(e.into()),
        };

        info!(product_id = %product.id, "Registered product");
        self.activity.record(ActivityEvent::new(
            "product",
            product.id,
            "registered",
            json!({ "sku": product.sku, "price": product.price }),
        ));

        Ok(product)
    }

    /// Fetch a product by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn product(&self, id: ProductId) -> Result<Option<Product>, EngineError> {
        Ok(self.store.product(id).await?)
    }

    /// Fetch a product by SKU.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn product_by_sku(&self, sku: &Sku) -> Result<Option<Product>, EngineError> {
        Ok(self.store.product_by_sku(sku).await?)
    }

    /// Activate or deactivate a product.
    ///
    /// Deactivation hides the product from checkout but never touches
    /// order history, which carries its own snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the product does not exist, or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(product = %id, active))]
    pub async fn set_active(&self, id: ProductId, active: bool) -> Result<(), EngineError> {
        if !self.store.set_product_active(id, active).await? {
            return Err(EngineError::not_found("product", id));
        }

        info!("Set product active flag");
        self.activity.record(ActivityEvent::new(
            "product",
            id,
            if active { "activated" } else { "deactivated" },
            json!({}),
        ));

        Ok(())
    }

    /// Create a category.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the name is blank,
    /// [`EngineError::NotFound`] if the parent does not exist, or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self, new), fields(name = %new.name))]
    pub async fn create_category(&self, new: NewCategory) -> Result<Category, EngineError> {
        if new.name.trim().is_empty() {
            return Err(EngineError::validation("category name cannot be empty"));
        }
        if let Some(parent_id) = new.parent_id
            && self.store.category(parent_id).await?.is_none()
        {
            return Err(EngineError::not_found("category", parent_id));
        }

        let category = self.store.insert_category(new).await?;

        info!(category_id = %category.id, "Created category");
        self.activity.record(ActivityEvent::new(
            "category",
            category.id,
            "created",
            json!({ "parent_id": category.parent_id }),
        ));

        Ok(category)
    }

    /// Move a category under a new parent, or to the root with `None`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the category or parent does
    /// not exist, [`EngineError::Validation`] if the move would create a
    /// cycle, or [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(category = %id))]
    pub async fn move_category(
        &self,
        id: CategoryId,
        new_parent: Option<CategoryId>,
    ) -> Result<(), EngineError> {
        let _tree = self.tree_lock.lock().await;

        if self.store.category(id).await?.is_none() {
            return Err(EngineError::not_found("category", id));
        }

        if let Some(parent_id) = new_parent {
            if parent_id == id {
                return Err(EngineError::validation(format!(
                    "category {id} cannot be its own parent"
                )));
            }
            if self.store.category(parent_id).await?.is_none() {
                return Err(EngineError::not_found("category", parent_id));
            }

            // Walk up from the new parent; reaching `id` means the move
            // would fold the subtree back onto itself.
            let mut visited = HashSet::new();
            let mut cursor = Some(parent_id);
            while let Some(current) = cursor {
                if current == id {
                    return Err(EngineError::validation(format!(
                        "moving category {id} under {parent_id} would create a cycle"
                    )));
                }
                if !visited.insert(current) {
                    return Err(EngineError::Persistence(StoreError::DataCorruption(
                        format!("category tree already contains a cycle at {current}"),
                    )));
                }
                let Some(node) = self.store.category(current).await? else {
                    return Err(EngineError::Persistence(StoreError::DataCorruption(
                        format!("category {current} has a dangling parent reference"),
                    )));
                };
                cursor = node.parent_id;
            }
        }

        if !self.store.set_category_parent(id, new_parent).await? {
            return Err(EngineError::not_found("category", id));
        }

        info!(parent = ?new_parent, "Moved category");
        self.activity.record(ActivityEvent::new(
            "category",
            id,
            "moved",
            json!({ "parent_id": new_parent }),
        ));

        Ok(())
    }

    /// Fetch a category by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn category(&self, id: CategoryId) -> Result<Option<Category>, EngineError> {
        Ok(self.store.category(id).await?)
    }

    /// Fetch every category.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn categories(&self) -> Result<Vec<Category>, EngineError> {
        Ok(self.store.categories().await?)
    }

    /// File a product under a category, or remove it from its category
    /// with `None`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the product or category does
    /// not exist, or [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(product = %product_id))]
    pub async fn assign_product_category(
        &self,
        product_id: ProductId,
        category_id: Option<CategoryId>,
    ) -> Result<(), EngineError> {
        if let Some(category_id) = category_id
            && self.store.category(category_id).await?.is_none()
        {
            return Err(EngineError::not_found("category", category_id));
        }

        if !self.store.set_product_category(product_id, category_id).await? {
            return Err(EngineError::not_found("product", product_id));
        }

        info!(category = ?category_id, "Assigned product category");
        self.activity.record(ActivityEvent::new(
            "product",
            product_id,
            "category_assigned",
            json!({ "category_id": category_id }),
        ));

        Ok(())
    }

    /// Submit a review.
    ///
    /// Reviews are not purchase-gated and may be anonymous.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the rating is outside 1-5,
    /// [`EngineError::NotFound`] if the product or named customer does not
    /// exist, or [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self, new), fields(product = %new.product_id, rating = new.rating))]
    pub async fn submit_review(&self, new: NewReview) -> Result<Review, EngineError> {
        if !(1..=5).contains(&new.rating) {
            return Err(EngineError::validation(format!(
                "rating must be between 1 and 5, got {}",
                new.rating
            )));
        }
        if self.store.product(new.product_id).await?.is_none() {
            return Err(EngineError::not_found("product", new.product_id));
        }
        if let Some(customer_id) = new.customer_id
            && self.store.customer(customer_id).await?.is_none()
        {
            return Err(EngineError::not_found("customer", customer_id));
        }

        let review = self.store.insert_review(new).await?;

        info!(review_id = %review.id, "Submitted review");
        self.activity.record(ActivityEvent::new(
            "review",
            review.id,
            "submitted",
            json!({ "product_id": review.product_id, "rating": review.rating }),
        ));

        Ok(review)
    }

    /// Fetch a product's reviews, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn reviews(&self, product_id: ProductId) -> Result<Vec<Review>, EngineError> {
        Ok(self.store.reviews_for_product(product_id).await?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::activity::MemoryActivityLog;
    use crate::models::{ProductImage, SupplierLink};
    use crate::store::MemoryStore;
    use stockroom_core::{SupplierId, TagId};

    fn service() -> CatalogService<MemoryStore> {
        CatalogService::new(Arc::new(MemoryStore::new()), Arc::new(MemoryActivityLog::new()))
    }

    fn new_product(sku: &str) -> NewProduct {
        NewProduct {
            sku: sku.parse().unwrap(),
            name: "Widget".to_string(),
            description: None,
            price: "19.99".parse().unwrap(),
            category_id: None,
            active: true,
            images: Vec::new(),
            suppliers: Vec::new(),
            tags: Vec::new(),
        }
    }

    fn image(primary: bool) -> ProductImage {
        ProductImage {
            url: "https://cdn.example.com/widget.jpg".to_string(),
            alt: None,
            position: 0,
            primary,
        }
    }

    #[tokio::test]
    async fn test_register_product_and_lookup_by_sku() {
        let service = service();
        let product = service.register_product(new_product("widget-01")).await.unwrap();
        assert!(product.active);

        // SKU lookup is case-insensitive because parsing uppercases.
        let found = service
            .product_by_sku(&"WIDGET-01".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, product.id);
    }

    #[tokio::test]
    async fn test_register_product_rejects_negative_price() {
        let service = service();
        let mut new = new_product("WIDGET-01");
        new.price = "-1.00".parse().unwrap();
        let err = service.register_product(new).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_register_product_requires_exactly_one_primary_image() {
        let service = service();

        let mut none_primary = new_product("WIDGET-01");
        none_primary.images = vec![image(false), image(false)];
        assert!(matches!(
            service.register_product(none_primary).await.unwrap_err(),
            EngineError::Validation(_)
        ));

        let mut two_primary = new_product("WIDGET-02");
        two_primary.images = vec![image(true), image(true)];
        assert!(matches!(
            service.register_product(two_primary).await.unwrap_err(),
            EngineError::Validation(_)
        ));

        let mut one_primary = new_product("WIDGET-03");
        one_primary.images = vec![image(true), image(false)];
        assert!(service.register_product(one_primary).await.is_ok());
    }

    #[tokio::test]
    async fn test_register_product_rejects_duplicate_suppliers_and_tags() {
        let service = service();

        let mut dup_supplier = new_product("WIDGET-01");
        dup_supplier.suppliers = vec![
            SupplierLink {
                supplier_id: SupplierId::new(1),
                supplier_sku: None,
                supplier_price: None,
            },
            SupplierLink {
                supplier_id: SupplierId::new(1),
                supplier_sku: None,
                supplier_price: None,
            },
        ];
        assert!(matches!(
            service.register_product(dup_supplier).await.unwrap_err(),
            EngineError::Validation(_)
        ));

        let mut dup_tag = new_product("WIDGET-02");
        dup_tag.tags = vec![TagId::new(3), TagId::new(3)];
        assert!(matches!(
            service.register_product(dup_tag).await.unwrap_err(),
            EngineError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_register_product_duplicate_sku_is_a_conflict() {
        let service = service();
        service.register_product(new_product("WIDGET-01")).await.unwrap();
        let err = service
            .register_product(new_product("widget-01"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_set_active_unknown_product() {
        let service = service();
        let err = service.set_active(ProductId::new(99), false).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_category_tree_rejects_cycles() {
        let service = service();
        let a = service
            .create_category(NewCategory {
                name: "A".to_string(),
                parent_id: None,
            })
            .await
            .unwrap();
        let b = service
            .create_category(NewCategory {
                name: "B".to_string(),
                parent_id: Some(a.id),
            })
            .await
            .unwrap();
        let c = service
            .create_category(NewCategory {
                name: "C".to_string(),
                parent_id: Some(b.id),
            })
            .await
            .unwrap();

        // A -> B -> C; moving A under C would close the loop.
        let err = service.move_category(a.id, Some(c.id)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Self-parenting is the degenerate cycle.
        let err = service.move_category(a.id, Some(a.id)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Moving C to the root is fine.
        service.move_category(c.id, None).await.unwrap();
        let reloaded = service.category(c.id).await.unwrap().unwrap();
        assert!(reloaded.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_assign_product_category_checks_both_sides() {
        let service = service();
        let product = service.register_product(new_product("WIDGET-01")).await.unwrap();

        let err = service
            .assign_product_category(product.id, Some(CategoryId::new(99)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let category = service
            .create_category(NewCategory {
                name: "Widgets".to_string(),
                parent_id: None,
            })
            .await
            .unwrap();
        service
            .assign_product_category(product.id, Some(category.id))
            .await
            .unwrap();
        let reloaded = service.product(product.id).await.unwrap().unwrap();
        assert_eq!(reloaded.category_id, Some(category.id));
    }

    #[tokio::test]
    async fn test_submit_review_validates_rating_and_product() {
        let service = service();
        let product = service.register_product(new_product("WIDGET-01")).await.unwrap();

        for rating in [0, 6] {
            let err = service
                .submit_review(NewReview {
                    product_id: product.id,
                    customer_id: None,
                    rating,
                    body: None,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)));
        }

        let err = service
            .submit_review(NewReview {
                product_id: ProductId::new(99),
                customer_id: None,
                rating: 4,
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let review = service
            .submit_review(NewReview {
                product_id: product.id,
                customer_id: None,
                rating: 4,
                body: Some("Solid widget".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(review.rating, 4);

        let reviews = service.reviews(product.id).await.unwrap();
        assert_eq!(reviews.len(), 1);
    }
}
