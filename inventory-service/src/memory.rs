//! In-process [`Repository`] for tests and local development.
//!
//! A transaction takes the store-wide lock when it begins and works on a
//! private copy of the data; commit publishes the copy, drop or rollback
//! discards it. Every transaction is therefore serializable, which is at
//! least as strong as the row locks the Postgres adapter takes.

use crate::repository::{
    Lock, NewProductionEvent, NewReservation, RepoError, RepoResult, Repository, ReservationFilter, Transaction,
};
use async_trait::async_trait;
use shared::{Product, ProductInventory, ProductionEvent, Reservation, ReserveState};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Store {
    products: BTreeMap<String, Product>,
    available: BTreeMap<String, i64>,
    production_events: Vec<ProductionEvent>,
    reservations: Vec<Reservation>,
    next_event_id: i64,
    next_reservation_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    store: Arc<Mutex<Store>>,
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Store>,
    working: Store,
    savepoints: Vec<Store>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored production event for `sku`, oldest first.
    pub async fn production_events(&self, sku: &str) -> Vec<ProductionEvent> {
        let store = self.store.lock().await;
        store.production_events.iter().filter(|e| e.sku == sku).cloned().collect()
    }
}

impl Store {
    fn product(&self, sku: &str) -> RepoResult<Product> {
        self.products.get(sku).cloned().ok_or(RepoError::NotFound)
    }

    fn product_inventory(&self, sku: &str) -> RepoResult<ProductInventory> {
        let product = self.product(sku)?;
        let available = *self.available.get(sku).ok_or(RepoError::NotFound)?;
        Ok(ProductInventory { product, available })
    }

    fn all_product_inventory(&self, limit: i64, offset: i64) -> Vec<ProductInventory> {
        self.available
            .iter()
            .filter_map(|(sku, available)| {
                let product = self.products.get(sku)?.clone();
                Some(ProductInventory {
                    product,
                    available: *available,
                })
            })
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect()
    }

    fn production_event(&self, request_id: &str) -> RepoResult<ProductionEvent> {
        self.production_events
            .iter()
            .find(|e| e.request_id == request_id)
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    fn reservation_by<F>(&self, pred: F) -> RepoResult<Reservation>
    where
        F: Fn(&Reservation) -> bool,
    {
        self.reservations.iter().find(|r| pred(r)).cloned().ok_or(RepoError::NotFound)
    }

    fn reservations(&self, filter: &ReservationFilter, limit: i64, offset: i64) -> Vec<Reservation> {
        let mut matching: Vec<Reservation> = self.reservations.iter().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> RepoResult<MemoryTransaction> {
        let guard = self.store.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTransaction {
            guard,
            working,
            savepoints: Vec::new(),
        })
    }

    async fn get_product(&self, sku: &str) -> RepoResult<Product> {
        self.store.lock().await.product(sku)
    }

    async fn get_product_inventory(&self, sku: &str) -> RepoResult<ProductInventory> {
        self.store.lock().await.product_inventory(sku)
    }

    async fn get_all_product_inventory(&self, limit: i64, offset: i64) -> RepoResult<Vec<ProductInventory>> {
        Ok(self.store.lock().await.all_product_inventory(limit, offset))
    }

    async fn get_production_event_by_request_id(&self, request_id: &str) -> RepoResult<ProductionEvent> {
        self.store.lock().await.production_event(request_id)
    }

    async fn get_reservation(&self, id: i64) -> RepoResult<Reservation> {
        self.store.lock().await.reservation_by(|r| r.id == id)
    }

    async fn get_reservation_by_request_id(&self, request_id: &str) -> RepoResult<Reservation> {
        self.store.lock().await.reservation_by(|r| r.request_id == request_id)
    }

    async fn get_reservations(
        &self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
    ) -> RepoResult<Vec<Reservation>> {
        Ok(self.store.lock().await.reservations(filter, limit, offset))
    }
}

// Lock modes are accepted but ignored below: the whole store is already held.
#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get_product(&mut self, sku: &str, _lock: Lock) -> RepoResult<Product> {
        self.working.product(sku)
    }

    async fn save_product(&mut self, product: &Product) -> RepoResult<()> {
        if self.working.products.contains_key(&product.sku) {
            return Err(RepoError::AlreadyExists);
        }
        self.working.products.insert(product.sku.clone(), product.clone());
        Ok(())
    }

    async fn get_product_inventory(&mut self, sku: &str, _lock: Lock) -> RepoResult<ProductInventory> {
        self.working.product_inventory(sku)
    }

    async fn save_product_inventory(&mut self, inventory: &ProductInventory) -> RepoResult<()> {
        if !self.working.products.contains_key(inventory.sku()) {
            return Err(anyhow::anyhow!("no product row for sku {}", inventory.sku()).into());
        }
        if inventory.available < 0 {
            return Err(anyhow::anyhow!("available must not be negative for sku {}", inventory.sku()).into());
        }
        self.working.available.insert(inventory.sku().to_string(), inventory.available);
        Ok(())
    }

    async fn get_production_event_by_request_id(
        &mut self,
        request_id: &str,
        _lock: Lock,
    ) -> RepoResult<ProductionEvent> {
        self.working.production_event(request_id)
    }

    async fn save_production_event(&mut self, event: NewProductionEvent) -> RepoResult<ProductionEvent> {
        if self.working.production_event(&event.request_id).is_ok() {
            return Err(RepoError::AlreadyExists);
        }
        self.working.next_event_id += 1;
        let stored = ProductionEvent {
            id: self.working.next_event_id,
            request_id: event.request_id,
            sku: event.sku,
            quantity: event.quantity,
            created: event.created,
        };
        self.working.production_events.push(stored.clone());
        Ok(stored)
    }

    async fn get_reservation_by_request_id(&mut self, request_id: &str, _lock: Lock) -> RepoResult<Reservation> {
        self.working.reservation_by(|r| r.request_id == request_id)
    }

    async fn get_reservations(
        &mut self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
        _lock: Lock,
    ) -> RepoResult<Vec<Reservation>> {
        Ok(self.working.reservations(filter, limit, offset))
    }

    async fn save_reservation(&mut self, reservation: NewReservation) -> RepoResult<Reservation> {
        if self.working.reservation_by(|r| r.request_id == reservation.request_id).is_ok() {
            return Err(RepoError::AlreadyExists);
        }
        self.working.next_reservation_id += 1;
        let stored = Reservation {
            id: self.working.next_reservation_id,
            request_id: reservation.request_id,
            requester: reservation.requester,
            sku: reservation.sku,
            state: reservation.state,
            reserved_quantity: reservation.reserved_quantity,
            requested_quantity: reservation.requested_quantity,
            created: reservation.created,
        };
        self.working.reservations.push(stored.clone());
        Ok(stored)
    }

    async fn update_reservation(&mut self, id: i64, state: ReserveState, reserved_quantity: i64) -> RepoResult<()> {
        let reservation = self
            .working
            .reservations
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(RepoError::NotFound)?;
        reservation.state = state;
        reservation.reserved_quantity = reserved_quantity;
        Ok(())
    }

    async fn savepoint(&mut self) -> RepoResult<()> {
        self.savepoints.push(self.working.clone());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> RepoResult<()> {
        self.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("no savepoint to release").into())
    }

    async fn rollback_to_savepoint(&mut self) -> RepoResult<()> {
        let saved = self
            .savepoints
            .pop()
            .ok_or_else(|| RepoError::from(anyhow::anyhow!("no savepoint to roll back to")))?;
        self.working = saved;
        Ok(())
    }

    async fn commit(mut self) -> RepoResult<()> {
        *self.guard = self.working;
        Ok(())
    }

    async fn rollback(self) -> RepoResult<()> {
        Ok(())
    }
}
