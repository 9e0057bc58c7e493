//! Customer accounts and address books.

use std::sync::Arc;

use serde_json::json;
use stockroom_core::{AddressId, CustomerId, Email};
use tracing::{info, instrument};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::error::EngineError;
use crate::models::{Address, Customer, CustomerProfile, NewAddress, NewCustomer};
use crate::store::{Store, StoreError};

/// Customer account service.
pub struct CustomerService<S> {
    store: Arc<S>,
    activity: Arc<dyn ActivityLog>,
}

impl<S> Clone for CustomerService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            activity: Arc::clone(&self.activity),
        }
    }
}

impl<S: Store> CustomerService<S> {
    pub(crate) fn new(store: Arc<S>, activity: Arc<dyn ActivityLog>) -> Self {
        Self { store, activity }
    }

    /// Register a customer.
    ///
    /// The email arrives pre-validated and lowercased as an [`Email`];
    /// uniqueness is enforced by the store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the name or password hash is
    /// blank, [`EngineError::Conflict`] if the email is already
    /// registered, or [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self, new), fields(email = %new.email))]
    pub async fn register(&self, new: NewCustomer) -> Result<Customer, EngineError> {
        if new.name.trim().is_empty() {
            return Err(EngineError::validation("customer name cannot be empty"));
        }
        if new.password_hash.is_empty() {
            return Err(EngineError::validation("password hash cannot be empty"));
        }

        let customer = match self.store.insert_customer(new).await {
            Ok(customer) => customer,
            Err(StoreError::Conflict(message)) => return Err(EngineError::conflict(message)),
            Err(e) => return Err(e.into()),
        };

        info!(customer_id = %customer.id, "Registered customer");
        self.activity.record(ActivityEvent::new(
            "customer",
            customer.id,
            "registered",
            json!({ "email": customer.email }),
        ));

        Ok(customer)
    }

    /// Fetch a customer by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn customer(&self, id: CustomerId) -> Result<Option<Customer>, EngineError> {
        Ok(self.store.customer(id).await?)
    }

    /// Fetch a customer by email.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn customer_by_email(&self, email: &Email) -> Result<Option<Customer>, EngineError> {
        Ok(self.store.customer_by_email(email).await?)
    }

    /// Create or replace a customer's profile.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the customer does not exist,
    /// or [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self), fields(customer = %customer_id))]
    pub async fn upsert_profile(
        &self,
        customer_id: CustomerId,
        phone: Option<String>,
        marketing_opt_in: bool,
    ) -> Result<CustomerProfile, EngineError> {
        if self.store.customer(customer_id).await?.is_none() {
            return Err(EngineError::not_found("customer", customer_id));
        }

        let profile = CustomerProfile {
            customer_id,
            phone,
            marketing_opt_in,
        };
        self.store.upsert_profile(profile.clone()).await?;

        info!("Upserted customer profile");
        self.activity.record(ActivityEvent::new(
            "customer",
            customer_id,
            "profile_upserted",
            json!({ "marketing_opt_in": marketing_opt_in }),
        ));

        Ok(profile)
    }

    /// Fetch a customer's profile.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn profile(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<CustomerProfile>, EngineError> {
        Ok(self.store.profile(customer_id).await?)
    }

    /// Add an address to a customer's address book.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the customer does not exist,
    /// [`EngineError::Validation`] if a required field is blank, or
    /// [`EngineError::Persistence`] if the store fails.
    #[instrument(skip(self, new), fields(customer = %new.customer_id))]
    pub async fn add_address(&self, new: NewAddress) -> Result<Address, EngineError> {
        for (field, value) in [
            ("line1", &new.line1),
            ("city", &new.city),
            ("postal code", &new.postal_code),
            ("country", &new.country),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::validation(format!(
                    "address {field} cannot be empty"
                )));
            }
        }

        if self.store.customer(new.customer_id).await?.is_none() {
            return Err(EngineError::not_found("customer", new.customer_id));
        }

        let address = self.store.insert_address(new).await?;

        info!(address_id = %address.id, "Added address");
        self.activity.record(ActivityEvent::new(
            "address",
            address.id,
            "added",
            json!({ "customer_id": address.customer_id }),
        ));

        Ok(address)
    }

    /// Fetch an address by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn address(&self, id: AddressId) -> Result<Option<Address>, EngineError> {
        Ok(self.store.address(id).await?)
    }

    /// Fetch a customer's addresses, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store fails.
    pub async fn addresses(&self, customer_id: CustomerId) -> Result<Vec<Address>, EngineError> {
        Ok(self.store.addresses_for_customer(customer_id).await?)
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
    use crate::store::MemoryStore;

    fn service() -> CustomerService<MemoryStore> {
        CustomerService::new(Arc::new(MemoryStore::new()), Arc::new(MemoryActivityLog::new()))
    }

    fn new_customer(email: &str) -> NewCustomer {
        NewCustomer {
            email: email.parse().unwrap(),
            name: "Shopper".to_string(),
            password_hash: "argon2-hash".to_string(),
        }
    }

    fn new_address(customer_id: CustomerId) -> NewAddress {
        NewAddress {
            customer_id,
            line1: "1 Main St".to_string(),
            line2: None,
            city: "Springfield".to_string(),
            region: Some("OR".to_string()),
            postal_code: "97477".to_string(),
            country: "US".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_fetch() {
        let service = service();
        let customer = service.register(new_customer("a@example.com")).await.unwrap();

        let fetched = service.customer(customer.id).await.unwrap().unwrap();
        assert_eq!(fetched.email.as_str(), "a@example.com");

        let by_email = service
            .customer_by_email(&"a@example.com".parse().unwrap())
            .await
            .unwrap();
        assert!(by_email.is_some());
    }

    #[tokio::test]
    async fn test_register_duplicate_email_is_a_conflict() {
        let service = service();
        service.register(new_customer("a@example.com")).await.unwrap();

        // Same address in different case normalizes to the same email.
        let err = service
            .register(new_customer("A@Example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_blank_name() {
        let service = service();
        let mut new = new_customer("a@example.com");
        new.name = "   ".to_string();
        let err = service.register(new).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_profile_roundtrip_and_unknown_customer() {
        let service = service();
        let customer = service.register(new_customer("a@example.com")).await.unwrap();

        service
            .upsert_profile(customer.id, Some("555-0100".to_string()), true)
            .await
            .unwrap();
        let profile = service.profile(customer.id).await.unwrap().unwrap();
        assert!(profile.marketing_opt_in);

        // Upsert replaces.
        service.upsert_profile(customer.id, None, false).await.unwrap();
        let profile = service.profile(customer.id).await.unwrap().unwrap();
        assert!(!profile.marketing_opt_in);
        assert!(profile.phone.is_none());

        let err = service
            .upsert_profile(CustomerId::new(999), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_add_address_validates_fields_and_owner() {
        let service = service();
        let customer = service.register(new_customer("a@example.com")).await.unwrap();

        let mut blank = new_address(customer.id);
        blank.city = String::new();
        let err = service.add_address(blank).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = service
            .add_address(new_address(CustomerId::new(999)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let address = service.add_address(new_address(customer.id)).await.unwrap();
        assert_eq!(address.customer_id, customer.id);
    }

    #[tokio::test]
    async fn test_addresses_list_in_insertion_order() {
        let service = service();
        let customer = service.register(new_customer("a@example.com")).await.unwrap();

        let first = service.add_address(new_address(customer.id)).await.unwrap();
        let mut second_new = new_address(customer.id);
        second_new.line1 = "2 Oak Ave".to_string();
        let second = service.add_address(second_new).await.unwrap();

        let addresses = service.addresses(customer.id).await.unwrap();
        assert_eq!(
            addresses.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
    }
}
