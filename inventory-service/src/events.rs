use anyhow::Result;
use async_trait::async_trait;
use shared::{ProductInventory, Reservation};
use std::sync::Arc;

/// Durable outbound channel for committed inventory and reservation changes.
///
/// Implementations deliver at least once. A failed publish is reported to
/// the caller; it never undoes the change that was published.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<()>;

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<()>;
}

#[async_trait]
impl<S> EventSink for Arc<S>
where
    S: EventSink + ?Sized,
{
    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<()> {
        (**self).publish_inventory(inventory).await
    }

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<()> {
        (**self).publish_reservation(reservation).await
    }
}

/// Sink that drops every update. Useful when only in-process subscribers matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish_inventory(&self, _inventory: &ProductInventory) -> Result<()> {
        Ok(())
    }

    async fn publish_reservation(&self, _reservation: &Reservation) -> Result<()> {
        Ok(())
    }
}
