//! Storage port used by the inventory engine.
//!
//! The engine never talks to a database directly. It opens a [`Transaction`]
//! through a [`Repository`], reads rows with an explicit [`Lock`] mode and
//! writes through the same transaction. Adapters decide what a row lock means
//! (`SELECT ... FOR UPDATE` for Postgres, a store-wide mutex in memory).
//!
//! Dropping a transaction without calling [`Transaction::commit`] must discard
//! every write made through it. Engine operations rely on this for
//! cancellation: a dropped future drops its transaction.

use async_trait::async_trait;
use shared::{Product, ProductInventory, ProductionEvent, Reservation, ReserveState};
use thiserror::Error;
use chrono::{DateTime, Utc};

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("record not found")]
    NotFound,

    /// A unique key (sku, request id) already exists.
    #[error("record already exists")]
    AlreadyExists,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound)
    }
}

/// Row locking mode for reads made inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lock {
    #[default]
    None,
    /// Hold a pessimistic lock on the rows read until the transaction ends.
    ForUpdate,
}

impl Lock {
    pub fn for_update(self) -> bool {
        self == Lock::ForUpdate
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub sku: Option<String>,
    pub state: Option<ReserveState>,
}

impl ReservationFilter {
    pub fn open_for(sku: impl Into<String>) -> Self {
        Self {
            sku: Some(sku.into()),
            state: Some(ReserveState::Open),
        }
    }

    pub fn matches(&self, reservation: &Reservation) -> bool {
        self.sku.as_deref().map_or(true, |sku| reservation.sku == sku)
            && self.state.map_or(true, |state| reservation.state == state)
    }
}

/// A production event that has not been stored yet.
#[derive(Debug, Clone)]
pub struct NewProductionEvent {
    pub request_id: String,
    pub sku: String,
    pub quantity: i64,
    pub created: DateTime<Utc>,
}

/// A reservation that has not been stored yet.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub request_id: String,
    pub requester: String,
    pub sku: String,
    pub state: ReserveState,
    pub reserved_quantity: i64,
    pub requested_quantity: i64,
    pub created: DateTime<Utc>,
}

#[async_trait]
pub trait Repository: Send + Sync + 'static {
    type Tx: Transaction;

    async fn begin(&self) -> RepoResult<Self::Tx>;

    async fn get_product(&self, sku: &str) -> RepoResult<Product>;

    async fn get_product_inventory(&self, sku: &str) -> RepoResult<ProductInventory>;

    /// Inventory rows ordered by sku.
    async fn get_all_product_inventory(&self, limit: i64, offset: i64) -> RepoResult<Vec<ProductInventory>>;

    async fn get_production_event_by_request_id(&self, request_id: &str) -> RepoResult<ProductionEvent>;

    async fn get_reservation(&self, id: i64) -> RepoResult<Reservation>;

    async fn get_reservation_by_request_id(&self, request_id: &str) -> RepoResult<Reservation>;

    /// Reservations ordered oldest first, by `(created, id)`.
    async fn get_reservations(
        &self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
    ) -> RepoResult<Vec<Reservation>>;
}

#[async_trait]
pub trait Transaction: Send + Sized {
    async fn get_product(&mut self, sku: &str, lock: Lock) -> RepoResult<Product>;

    async fn save_product(&mut self, product: &Product) -> RepoResult<()>;

    async fn get_product_inventory(&mut self, sku: &str, lock: Lock) -> RepoResult<ProductInventory>;

    /// Inserts the row, or overwrites `available` if it already exists.
    async fn save_product_inventory(&mut self, inventory: &ProductInventory) -> RepoResult<()>;

    async fn get_production_event_by_request_id(
        &mut self,
        request_id: &str,
        lock: Lock,
    ) -> RepoResult<ProductionEvent>;

    async fn save_production_event(&mut self, event: NewProductionEvent) -> RepoResult<ProductionEvent>;

    async fn get_reservation_by_request_id(&mut self, request_id: &str, lock: Lock) -> RepoResult<Reservation>;

    async fn get_reservations(
        &mut self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
        lock: Lock,
    ) -> RepoResult<Vec<Reservation>>;

    async fn save_reservation(&mut self, reservation: NewReservation) -> RepoResult<Reservation>;

    async fn update_reservation(&mut self, id: i64, state: ReserveState, reserved_quantity: i64) -> RepoResult<()>;

    /// Opens a nested scope that can be rolled back on its own.
    async fn savepoint(&mut self) -> RepoResult<()>;

    async fn release_savepoint(&mut self) -> RepoResult<()>;

    async fn rollback_to_savepoint(&mut self) -> RepoResult<()>;

    async fn commit(self) -> RepoResult<()>;

    async fn rollback(self) -> RepoResult<()>;
}
