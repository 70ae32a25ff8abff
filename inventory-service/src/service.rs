//! The inventory reservation and fulfillment engine.
//!
//! All cross-request exclusion is delegated to the [`Repository`]: production
//! locks the inventory row, reservation locks the product row, and a
//! fulfillment pass locks the inventory row and then the open reservations it
//! walks. Updates are only published once the transaction that produced them
//! has committed.
//!
//! Commit and publish for one sku run under that sku's ordering lock, taken
//! before the transaction begins, so observers receive a sku's updates in
//! commit order.

use crate::error::{InventoryError, Result};
use crate::events::EventSink;
use crate::repository::{
    Lock, NewProductionEvent, NewReservation, RepoError, Repository, ReservationFilter, Transaction,
};
use crate::subscriptions::{Registry, SubscriptionId};
use chrono::Utc;
use shared::{Product, ProductInventory, ProductionRequest, Reservation, ReservationRequest, ReserveState};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub type InventorySubscription = SubscriptionId<ProductInventory>;
pub type ReservationSubscription = SubscriptionId<Reservation>;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Open reservations locked and walked per page of a fulfillment pass.
    pub fill_batch_size: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { fill_batch_size: 100 }
    }
}

const SKU_LOCK_SHARDS: usize = 64;

pub struct InventoryService<R, E> {
    repo: R,
    events: E,
    config: ServiceConfig,
    sku_locks: SkuLocks,
    inventory_subscribers: Registry<ProductInventory>,
    reservation_subscribers: Registry<Reservation>,
}

#[derive(Debug, Clone)]
enum Update {
    Inventory(ProductInventory),
    Reservation(Reservation),
}

enum Staged<T, P = T> {
    Applied(T),
    /// The idempotency key was already stored; nothing was written.
    Replayed(P),
}

/// Per-sku ordering locks. Skus hash onto a fixed set of shards, so two skus
/// may share a lock; a caller never holds more than one.
struct SkuLocks {
    shards: Vec<Mutex<()>>,
}

impl SkuLocks {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, sku: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        sku.hash(&mut hasher);
        let shard = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[shard].lock().await
    }
}

/// Committed-or-not bookkeeping for one fulfillment pass.
struct FillPass {
    updates: Vec<Update>,
    /// False once a nested scope could not be closed cleanly; the outer
    /// transaction must then be rolled back rather than committed.
    intact: bool,
}

impl<R, E> InventoryService<R, E>
where
    R: Repository,
    E: EventSink,
{
    /// Spawns the subscriber registries, so it must run inside a Tokio runtime.
    pub fn new(repo: R, events: E) -> Self {
        Self::with_config(repo, events, ServiceConfig::default())
    }

    pub fn with_config(repo: R, events: E, config: ServiceConfig) -> Self {
        info!(fill_batch_size = config.fill_batch_size, "creating inventory service");
        Self {
            repo,
            events,
            config,
            sku_locks: SkuLocks::new(SKU_LOCK_SHARDS),
            inventory_subscribers: Registry::spawn("inventory"),
            reservation_subscribers: Registry::spawn("reservations"),
        }
    }

    /// Creates the product with zero stock. Creating an existing sku is a no-op.
    #[tracing::instrument(name = "inventory.create_product", skip_all, fields(sku = %product.sku))]
    pub async fn create_product(&self, product: Product) -> Result<()> {
        require("sku", &product.sku)?;

        match self.repo.get_product(&product.sku).await {
            Ok(_) => {
                debug!("product already exists");
                return Ok(());
            }
            Err(RepoError::NotFound) => {}
            Err(err) => return Err(InventoryError::storage("get product")(err)),
        }

        let mut tx = self.repo.begin().await.map_err(InventoryError::storage("begin transaction"))?;
        match stage_product(&mut tx, &product).await {
            Ok(Staged::Applied(())) => {
                tx.commit().await.map_err(InventoryError::storage("commit product"))?;
                info!("product created");
                Ok(())
            }
            Ok(Staged::Replayed(())) => {
                rollback(tx, "product created concurrently").await;
                debug!("product already exists");
                Ok(())
            }
            Err(err) => {
                rollback(tx, &err).await;
                Err(err)
            }
        }
    }

    /// Applies a production request once per request id, then lets open
    /// reservations for the sku consume the new stock.
    ///
    /// An error returned after the production committed (publish or
    /// fulfillment) does not undo it; replaying the request is safe.
    #[tracing::instrument(
        name = "inventory.produce",
        skip_all,
        fields(sku = %product.sku, request_id = %request.request_id, quantity = request.quantity)
    )]
    pub async fn produce(&self, product: &Product, request: ProductionRequest) -> Result<()> {
        require("sku", &product.sku)?;
        require("request id", &request.request_id)?;
        if request.quantity < 1 {
            return Err(InventoryError::validation("quantity must be greater than zero"));
        }

        match self.repo.get_production_event_by_request_id(&request.request_id).await {
            Ok(_) => {
                debug!("production request already applied");
                return Ok(());
            }
            Err(RepoError::NotFound) => {}
            Err(err) => return Err(InventoryError::storage("get production event")(err)),
        }

        let ordered = self.sku_locks.lock(&product.sku).await;
        let mut tx = self.repo.begin().await.map_err(InventoryError::storage("begin transaction"))?;
        let inventory = match stage_production(&mut tx, &product.sku, &request).await {
            Ok(Staged::Applied(inventory)) => {
                tx.commit().await.map_err(InventoryError::storage("commit production"))?;
                inventory
            }
            Ok(Staged::Replayed(())) => {
                rollback(tx, "production request applied concurrently").await;
                debug!("production request already applied");
                return Ok(());
            }
            Err(err) => {
                rollback(tx, &err).await;
                return Err(err);
            }
        };
        info!(available = inventory.available, "production committed");

        let published = self.publish(vec![Update::Inventory(inventory)]).await;
        drop(ordered);

        let filled = self.fill_reserves(&product.sku).await.map_err(|source| InventoryError::Fulfillment {
            sku: product.sku.clone(),
            source: Box::new(source),
        });
        published.and(filled)
    }

    /// Records a reservation once per request id and lets it compete for the
    /// stock currently available.
    ///
    /// Returns the reservation as created (nothing reserved yet); fulfillment
    /// progress is observable through queries or subscriptions. A replayed
    /// request id returns the stored reservation unchanged.
    ///
    /// The product is locked before the request id is looked up, so a replay
    /// whose sku no longer names a known product fails with NotFound even if
    /// a reservation was stored under that request id.
    #[tracing::instrument(
        name = "inventory.reserve",
        skip_all,
        fields(sku = %request.sku, request_id = %request.request_id, requester = %request.requester, quantity = request.quantity)
    )]
    pub async fn reserve(&self, request: ReservationRequest) -> Result<Reservation> {
        require("request id", &request.request_id)?;
        require("requester", &request.requester)?;
        require("sku", &request.sku)?;
        if request.quantity < 1 {
            return Err(InventoryError::validation("quantity must be greater than zero"));
        }

        let ordered = self.sku_locks.lock(&request.sku).await;
        let mut tx = self.repo.begin().await.map_err(InventoryError::storage("begin transaction"))?;
        let reservation = match stage_reservation(&mut tx, &request).await {
            Ok(Staged::Applied(reservation)) => {
                tx.commit().await.map_err(InventoryError::storage("commit reservation"))?;
                reservation
            }
            Ok(Staged::Replayed(existing)) => {
                rollback(tx, "reservation already exists").await;
                debug!(id = existing.id, "reservation already exists, returning it");
                return Ok(existing);
            }
            Err(err) if matches!(err, InventoryError::Storage { source: RepoError::AlreadyExists, .. }) => {
                rollback(tx, &err).await;
                debug!("reservation created concurrently, returning it");
                return self
                    .repo
                    .get_reservation_by_request_id(&request.request_id)
                    .await
                    .map_err(InventoryError::lookup("reservation", &request.request_id, "get reservation"));
            }
            Err(err) => {
                rollback(tx, &err).await;
                return Err(err);
            }
        };
        info!(id = reservation.id, "reservation created");

        let published = self.publish(vec![Update::Reservation(reservation.clone())]).await;
        drop(ordered);

        let filled = self.fill_reserves(&request.sku).await.map_err(|source| InventoryError::Fulfillment {
            sku: request.sku.clone(),
            source: Box::new(source),
        });
        published.and(filled).map(|()| reservation)
    }

    /// Allocates available stock for `sku` to its open reservations, oldest
    /// first, until either runs out.
    ///
    /// Each grant (inventory decrement plus reservation update) is applied in
    /// its own nested scope. If a grant fails, grants made before it are
    /// still committed and published, and the error is returned.
    #[tracing::instrument(name = "inventory.fill_reserves", skip(self))]
    pub async fn fill_reserves(&self, sku: &str) -> Result<()> {
        let _ordered = self.sku_locks.lock(sku).await;
        let mut tx = self.repo.begin().await.map_err(InventoryError::storage("begin fulfillment"))?;
        let mut pass = FillPass {
            updates: Vec::new(),
            intact: true,
        };

        let outcome = self.allocate(&mut tx, sku, &mut pass).await;
        if outcome.is_err() && (!pass.intact || pass.updates.is_empty()) {
            if let Err(err) = &outcome {
                rollback(tx, err).await;
            }
            return outcome;
        }

        tx.commit().await.map_err(InventoryError::storage("commit fulfillment"))?;
        if !pass.updates.is_empty() {
            info!(grants = pass.updates.len() / 2, "fulfillment committed");
        }

        let published = self.publish(pass.updates).await;
        outcome.and(published)
    }

    async fn allocate(&self, tx: &mut R::Tx, sku: &str, pass: &mut FillPass) -> Result<()> {
        let mut inventory = tx
            .get_product_inventory(sku, Lock::ForUpdate)
            .await
            .map_err(InventoryError::lookup("product inventory", sku, "lock product inventory"))?;

        let batch = self.config.fill_batch_size.max(1);
        let filter = ReservationFilter::open_for(sku);

        while inventory.available > 0 {
            let open = tx
                .get_reservations(&filter, batch, 0, Lock::ForUpdate)
                .await
                .map_err(InventoryError::storage("lock open reservations"))?;
            let full_page = open.len() as i64 == batch;
            let mut closed = 0;

            for mut reservation in open {
                debug!(
                    reservation = %reservation.request_id,
                    available = inventory.available,
                    "fulfilling reservation"
                );
                if inventory.available == 0 {
                    break;
                }
                let granted = grant(&mut inventory, &mut reservation);
                if granted == 0 {
                    continue;
                }

                if let Err(err) = tx.savepoint().await {
                    pass.intact = false;
                    return Err(InventoryError::storage("open reservation savepoint")(err));
                }
                if let Err(err) = persist_grant(tx, &inventory, &reservation).await {
                    if let Err(rb) = tx.rollback_to_savepoint().await {
                        warn!(error = %rb, "failed to roll back reservation savepoint");
                        pass.intact = false;
                    }
                    return Err(err);
                }
                if let Err(err) = tx.release_savepoint().await {
                    pass.intact = false;
                    return Err(InventoryError::storage("release reservation savepoint")(err));
                }

                debug!(
                    reservation = %reservation.request_id,
                    granted,
                    state = %reservation.state,
                    "reservation updated"
                );
                if reservation.state == ReserveState::Closed {
                    closed += 1;
                }
                pass.updates.push(Update::Inventory(inventory.clone()));
                pass.updates.push(Update::Reservation(reservation));
            }

            // A short page means every open reservation has been seen; a page
            // that closed nothing cannot make progress on a re-read.
            if !full_page || closed == 0 {
                break;
            }
        }

        Ok(())
    }

    /// Delivers updates, in order, to the event sink and to live subscribers.
    /// Subscribers are notified even if the sink rejects an update; the first
    /// sink failure is returned once every update has been attempted.
    async fn publish(&self, updates: Vec<Update>) -> Result<()> {
        let mut failure = None;

        for update in updates {
            let sent = match &update {
                Update::Inventory(inventory) => self.events.publish_inventory(inventory).await,
                Update::Reservation(reservation) => self.events.publish_reservation(reservation).await,
            };
            if let Err(err) = sent {
                warn!(error = %err, "failed to publish update to event sink");
                if failure.is_none() {
                    failure = Some(err);
                }
            }

            match update {
                Update::Inventory(inventory) => self.inventory_subscribers.notify(inventory).await,
                Update::Reservation(reservation) => self.reservation_subscribers.notify(reservation).await,
            }
        }

        match failure {
            Some(err) => Err(InventoryError::Publish(err)),
            None => Ok(()),
        }
    }

    pub async fn get_product(&self, sku: &str) -> Result<Product> {
        debug!(sku, "getting product");
        self.repo
            .get_product(sku)
            .await
            .map_err(InventoryError::lookup("product", sku, "get product"))
    }

    pub async fn get_product_inventory(&self, sku: &str) -> Result<ProductInventory> {
        debug!(sku, "getting product inventory");
        self.repo
            .get_product_inventory(sku)
            .await
            .map_err(InventoryError::lookup("product inventory", sku, "get product inventory"))
    }

    pub async fn get_all_product_inventory(&self, limit: i64, offset: i64) -> Result<Vec<ProductInventory>> {
        check_page(limit, offset)?;
        self.repo
            .get_all_product_inventory(limit, offset)
            .await
            .map_err(InventoryError::storage("list product inventory"))
    }

    pub async fn get_reservation(&self, id: i64) -> Result<Reservation> {
        debug!(id, "getting reservation");
        self.repo
            .get_reservation(id)
            .await
            .map_err(InventoryError::lookup("reservation", id, "get reservation"))
    }

    pub async fn get_reservations(
        &self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Reservation>> {
        debug!(sku = ?filter.sku, state = ?filter.state, "getting reservations");
        check_page(limit, offset)?;
        self.repo
            .get_reservations(filter, limit, offset)
            .await
            .map_err(InventoryError::storage("list reservations"))
    }

    pub async fn subscribe_inventory(&self, sender: mpsc::Sender<ProductInventory>) -> InventorySubscription {
        let id = self.inventory_subscribers.subscribe(sender).await;
        debug!(%id, "subscribed to inventory");
        id
    }

    pub async fn unsubscribe_inventory(&self, id: InventorySubscription) -> bool {
        debug!(%id, "unsubscribing from inventory");
        self.inventory_subscribers.unsubscribe(id).await
    }

    pub async fn subscribe_reservations(&self, sender: mpsc::Sender<Reservation>) -> ReservationSubscription {
        let id = self.reservation_subscribers.subscribe(sender).await;
        debug!(%id, "subscribed to reservations");
        id
    }

    pub async fn unsubscribe_reservations(&self, id: ReservationSubscription) -> bool {
        debug!(%id, "unsubscribing from reservations");
        self.reservation_subscribers.unsubscribe(id).await
    }
}

/// Moves as much stock as `reservation` still needs, bounded by what is
/// available, and closes the reservation once it is whole. Returns the
/// quantity moved.
fn grant(inventory: &mut ProductInventory, reservation: &mut Reservation) -> i64 {
    let granted = reservation.outstanding().min(inventory.available).max(0);
    inventory.available -= granted;
    reservation.reserved_quantity += granted;
    if reservation.reserved_quantity == reservation.requested_quantity {
        reservation.state = ReserveState::Closed;
    }
    granted
}

async fn persist_grant<T: Transaction>(
    tx: &mut T,
    inventory: &ProductInventory,
    reservation: &Reservation,
) -> Result<()> {
    tx.save_product_inventory(inventory)
        .await
        .map_err(InventoryError::storage("save product inventory"))?;
    tx.update_reservation(reservation.id, reservation.state, reservation.reserved_quantity)
        .await
        .map_err(InventoryError::storage("update reservation"))
}

async fn stage_product<T: Transaction>(tx: &mut T, product: &Product) -> Result<Staged<()>> {
    debug!("creating product");
    match tx.save_product(product).await {
        Ok(()) => {}
        Err(RepoError::AlreadyExists) => return Ok(Staged::Replayed(())),
        Err(err) => return Err(InventoryError::storage("save product")(err)),
    }

    debug!("creating product inventory");
    tx.save_product_inventory(&ProductInventory::empty(product.clone()))
        .await
        .map_err(InventoryError::storage("save product inventory"))?;
    Ok(Staged::Applied(()))
}

async fn stage_production<T: Transaction>(
    tx: &mut T,
    sku: &str,
    request: &ProductionRequest,
) -> Result<Staged<ProductInventory, ()>> {
    let mut inventory = tx
        .get_product_inventory(sku, Lock::ForUpdate)
        .await
        .map_err(InventoryError::lookup("product inventory", sku, "lock product inventory"))?;

    match tx.get_production_event_by_request_id(&request.request_id, Lock::None).await {
        Ok(_) => return Ok(Staged::Replayed(())),
        Err(RepoError::NotFound) => {}
        Err(err) => return Err(InventoryError::storage("get production event")(err)),
    }

    let event = NewProductionEvent {
        request_id: request.request_id.clone(),
        sku: sku.to_string(),
        quantity: request.quantity,
        created: Utc::now(),
    };
    match tx.save_production_event(event).await {
        Ok(_) => {}
        Err(RepoError::AlreadyExists) => return Ok(Staged::Replayed(())),
        Err(err) => return Err(InventoryError::storage("save production event")(err)),
    }

    inventory.available = inventory
        .available
        .checked_add(request.quantity)
        .ok_or_else(|| InventoryError::validation("production would overflow available stock"))?;
    tx.save_product_inventory(&inventory)
        .await
        .map_err(InventoryError::storage("add production to product inventory"))?;
    Ok(Staged::Applied(inventory))
}

async fn stage_reservation<T: Transaction>(tx: &mut T, request: &ReservationRequest) -> Result<Staged<Reservation>> {
    tx.get_product(&request.sku, Lock::ForUpdate)
        .await
        .map_err(InventoryError::lookup("product", &request.sku, "lock product"))?;

    match tx.get_reservation_by_request_id(&request.request_id, Lock::ForUpdate).await {
        Ok(existing) => return Ok(Staged::Replayed(existing)),
        Err(RepoError::NotFound) => {}
        Err(err) => return Err(InventoryError::storage("get reservation")(err)),
    }

    let reservation = tx
        .save_reservation(NewReservation {
            request_id: request.request_id.clone(),
            requester: request.requester.clone(),
            sku: request.sku.clone(),
            state: ReserveState::Open,
            reserved_quantity: 0,
            requested_quantity: request.quantity,
            created: Utc::now(),
        })
        .await
        .map_err(InventoryError::storage("save reservation"))?;
    Ok(Staged::Applied(reservation))
}

/// Rolls back, logging rather than returning a rollback failure so it never
/// masks `reason`.
async fn rollback<T: Transaction>(tx: T, reason: impl fmt::Display) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, reason = %reason, "failed to rollback");
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(InventoryError::validation(format!("{field} is required")));
    }
    Ok(())
}

fn check_page(limit: i64, offset: i64) -> Result<()> {
    if limit < 1 {
        return Err(InventoryError::validation("limit must be greater than zero"));
    }
    if offset < 0 {
        return Err(InventoryError::validation("offset must not be negative"));
    }
    Ok(())
}
