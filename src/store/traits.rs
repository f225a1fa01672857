//! `OrderStore` trait: the async persistence interface for the order ledger.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::pipeline::types::ParsedRecipient;
use crate::store::model::{NewOrderRecord, OrderRecord, OrderStatus};

/// Backend-agnostic order ledger.
///
/// Implementations must enforce uniqueness of `message_id` atomically, so two
/// concurrent `insert` calls for the same message can never both succeed.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// True iff any record exists for `message_id`, regardless of status.
    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Create a `processing` record. Fails with `DuplicateKey` if the
    /// message id is already present.
    async fn insert(&self, record: &NewOrderRecord) -> Result<OrderRecord, DatabaseError>;

    /// Move a record along the state machine.
    ///
    /// `error_message` is required for `Failed` and rejected otherwise.
    /// Invalid edges fail with `InvalidTransition`. Always refreshes
    /// `updated_at`; never touches `created_at`.
    async fn update_status(
        &self,
        id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
    ) -> Result<OrderRecord, DatabaseError>;

    /// `processing → sent`, recording the provider's order id in the same write.
    async fn mark_sent(
        &self,
        id: &str,
        provider_order_id: &str,
    ) -> Result<OrderRecord, DatabaseError>;

    /// Attach the parsed recipient snapshot. Only `processing` records
    /// accept one.
    async fn set_recipient(
        &self,
        id: &str,
        recipient: &ParsedRecipient,
    ) -> Result<OrderRecord, DatabaseError>;

    /// Look up a record by internal id.
    async fn get(&self, id: &str) -> Result<Option<OrderRecord>, DatabaseError>;

    /// Look up a record by inbound message id.
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<OrderRecord>, DatabaseError>;

    /// Look up a record by the provider's order id.
    async fn find_by_provider_order_id(
        &self,
        provider_order_id: &str,
    ) -> Result<Option<OrderRecord>, DatabaseError>;

    /// Most recently created records first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<OrderRecord>, DatabaseError>;

    /// Apply a delivery-status update reported by the provider.
    ///
    /// Returns `Ok(None)` when the order is unknown, the provider status
    /// doesn't map to a ledger status, or the record can no longer move there.
    async fn apply_provider_status(
        &self,
        provider_order_id: &str,
        provider_status: &str,
    ) -> Result<Option<OrderRecord>, DatabaseError> {
        let Some(next) = OrderStatus::from_provider_status(provider_status) else {
            return Ok(None);
        };
        let Some(record) = self.find_by_provider_order_id(provider_order_id).await? else {
            return Ok(None);
        };
        if record.status == next {
            return Ok(Some(record));
        }
        if !record.status.can_transition_to(next) {
            tracing::warn!(
                order_id = %provider_order_id,
                from = %record.status,
                reported = %provider_status,
                "Ignoring provider status that the ledger cannot apply"
            );
            return Ok(None);
        }
        self.update_status(&record.id, next, None).await.map(Some)
    }
}
