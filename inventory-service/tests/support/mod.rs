#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use inventory_service::memory::MemoryTransaction;
use inventory_service::repository::{NewProductionEvent, NewReservation, RepoResult};
use inventory_service::{
    EventSink, InventoryService, Lock, MemoryRepository, RepoError, Repository, ReservationFilter, ServiceConfig,
    Transaction,
};
use shared::{Product, ProductInventory, ProductionEvent, ProductionRequest, Reservation, ReservationRequest, ReserveState};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    Inventory(ProductInventory),
    Reservation(Reservation),
}

/// Event sink that keeps everything it is given, and can be told to fail or
/// to stall.
#[derive(Clone, Default)]
pub struct RecordingSink {
    published: Arc<Mutex<Vec<Published>>>,
    failing: Arc<AtomicBool>,
    next_inventory_delay_ms: Arc<AtomicU64>,
}

impl RecordingSink {
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn inventory(&self) -> Vec<ProductInventory> {
        self.published()
            .into_iter()
            .filter_map(|p| match p {
                Published::Inventory(inventory) => Some(inventory),
                Published::Reservation(_) => None,
            })
            .collect()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.published()
            .into_iter()
            .filter_map(|p| match p {
                Published::Reservation(reservation) => Some(reservation),
                Published::Inventory(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Holds the next inventory publish for `delay` before recording it.
    pub fn delay_next_inventory(&self, delay: Duration) {
        self.next_inventory_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn record(&self, published: Published) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("broker unavailable");
        }
        self.published.lock().unwrap().push(published);
        Ok(())
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish_inventory(&self, inventory: &ProductInventory) -> Result<()> {
        let delay = self.next_inventory_delay_ms.swap(0, Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.record(Published::Inventory(inventory.clone()))
    }

    async fn publish_reservation(&self, reservation: &Reservation) -> Result<()> {
        self.record(Published::Reservation(reservation.clone()))
    }
}

/// Lets a number of calls through, then fails every call after them.
#[derive(Default)]
struct Budget {
    remaining: AtomicUsize,
    armed: AtomicBool,
}

impl Budget {
    fn arm(&self, successes: usize) {
        self.remaining.store(successes, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    fn take(&self, what: &str) -> RepoResult<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining == 0 {
            return Err(anyhow::anyhow!("injected {what} failure").into());
        }
        self.remaining.store(remaining - 1, Ordering::SeqCst);
        Ok(())
    }
}

/// Faults injected into [`FlakyRepository`] transactions.
#[derive(Default)]
pub struct Faults {
    update_reservation: Budget,
    savepoint: Budget,
    commit_delay_ms: AtomicU64,
    fail_begin: AtomicBool,
    /// Makes the next reservation insert look like it lost a race: the
    /// in-transaction lookup misses and the insert hits the unique key.
    reservation_insert_race: AtomicBool,
}

impl Faults {
    pub fn fail_update_reservation_after(&self, successes: usize) {
        self.update_reservation.arm(successes);
    }

    pub fn fail_savepoint_after(&self, successes: usize) {
        self.savepoint.arm(successes);
    }

    pub fn race_next_reservation_insert(&self) {
        self.reservation_insert_race.store(true, Ordering::SeqCst);
    }

    pub fn delay_commits(&self, delay: Duration) {
        self.commit_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_begin(&self, failing: bool) {
        self.fail_begin.store(failing, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.update_reservation.disarm();
        self.savepoint.disarm();
        self.commit_delay_ms.store(0, Ordering::SeqCst);
        self.fail_begin.store(false, Ordering::SeqCst);
        self.reservation_insert_race.store(false, Ordering::SeqCst);
    }
}

/// Memory repository wrapper whose transactions fail on demand.
#[derive(Clone, Default)]
pub struct FlakyRepository {
    pub inner: MemoryRepository,
    pub faults: Arc<Faults>,
}

pub struct FlakyTransaction {
    inner: MemoryTransaction,
    faults: Arc<Faults>,
}

#[async_trait]
impl Repository for FlakyRepository {
    type Tx = FlakyTransaction;

    async fn begin(&self) -> RepoResult<FlakyTransaction> {
        if self.faults.fail_begin.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected connection failure").into());
        }
        Ok(FlakyTransaction {
            inner: self.inner.begin().await?,
            faults: self.faults.clone(),
        })
    }

    async fn get_product(&self, sku: &str) -> RepoResult<Product> {
        self.inner.get_product(sku).await
    }

    async fn get_product_inventory(&self, sku: &str) -> RepoResult<ProductInventory> {
        self.inner.get_product_inventory(sku).await
    }

    async fn get_all_product_inventory(&self, limit: i64, offset: i64) -> RepoResult<Vec<ProductInventory>> {
        self.inner.get_all_product_inventory(limit, offset).await
    }

    async fn get_production_event_by_request_id(&self, request_id: &str) -> RepoResult<ProductionEvent> {
        self.inner.get_production_event_by_request_id(request_id).await
    }

    async fn get_reservation(&self, id: i64) -> RepoResult<Reservation> {
        self.inner.get_reservation(id).await
    }

    async fn get_reservation_by_request_id(&self, request_id: &str) -> RepoResult<Reservation> {
        self.inner.get_reservation_by_request_id(request_id).await
    }

    async fn get_reservations(
        &self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
    ) -> RepoResult<Vec<Reservation>> {
        self.inner.get_reservations(filter, limit, offset).await
    }
}

#[async_trait]
impl Transaction for FlakyTransaction {
    async fn get_product(&mut self, sku: &str, lock: Lock) -> RepoResult<Product> {
        self.inner.get_product(sku, lock).await
    }

    async fn save_product(&mut self, product: &Product) -> RepoResult<()> {
        self.inner.save_product(product).await
    }

    async fn get_product_inventory(&mut self, sku: &str, lock: Lock) -> RepoResult<ProductInventory> {
        self.inner.get_product_inventory(sku, lock).await
    }

    async fn save_product_inventory(&mut self, inventory: &ProductInventory) -> RepoResult<()> {
        self.inner.save_product_inventory(inventory).await
    }

    async fn get_production_event_by_request_id(
        &mut self,
        request_id: &str,
        lock: Lock,
    ) -> RepoResult<ProductionEvent> {
        self.inner.get_production_event_by_request_id(request_id, lock).await
    }

    async fn save_production_event(&mut self, event: NewProductionEvent) -> RepoResult<ProductionEvent> {
        self.inner.save_production_event(event).await
    }

    async fn get_reservation_by_request_id(&mut self, request_id: &str, lock: Lock) -> RepoResult<Reservation> {
        if self.faults.reservation_insert_race.load(Ordering::SeqCst) {
            return Err(RepoError::NotFound);
        }
        self.inner.get_reservation_by_request_id(request_id, lock).await
    }

    async fn get_reservations(
        &mut self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
        lock: Lock,
    ) -> RepoResult<Vec<Reservation>> {
        self.inner.get_reservations(filter, limit, offset, lock).await
    }

    async fn save_reservation(&mut self, reservation: NewReservation) -> RepoResult<Reservation> {
        if self.faults.reservation_insert_race.swap(false, Ordering::SeqCst) {
            return Err(RepoError::AlreadyExists);
        }
        self.inner.save_reservation(reservation).await
    }

    async fn update_reservation(&mut self, id: i64, state: ReserveState, reserved_quantity: i64) -> RepoResult<()> {
        self.faults.update_reservation.take("reservation update")?;
        self.inner.update_reservation(id, state, reserved_quantity).await
    }

    async fn savepoint(&mut self) -> RepoResult<()> {
        self.faults.savepoint.take("savepoint")?;
        self.inner.savepoint().await
    }

    async fn release_savepoint(&mut self) -> RepoResult<()> {
        self.inner.release_savepoint().await
    }

    async fn rollback_to_savepoint(&mut self) -> RepoResult<()> {
        self.inner.rollback_to_savepoint().await
    }

    async fn commit(self) -> RepoResult<()> {
        let delay = self.faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.commit().await
    }

    async fn rollback(self) -> RepoResult<()> {
        self.inner.rollback().await
    }
}

pub type MemoryService = InventoryService<MemoryRepository, RecordingSink>;
pub type FlakyService = InventoryService<FlakyRepository, RecordingSink>;

pub fn widget() -> Product {
    Product::new("sku1", "upc1", "Widget")
}

pub async fn memory_service() -> (MemoryService, MemoryRepository, RecordingSink) {
    let repo = MemoryRepository::new();
    let sink = RecordingSink::default();
    let service = InventoryService::new(repo.clone(), sink.clone());
    service.create_product(widget()).await.unwrap();
    (service, repo, sink)
}

pub async fn flaky_service(config: ServiceConfig) -> (FlakyService, FlakyRepository, RecordingSink) {
    let repo = FlakyRepository::default();
    let sink = RecordingSink::default();
    let service = InventoryService::with_config(repo.clone(), sink.clone(), config);
    service.create_product(widget()).await.unwrap();
    (service, repo, sink)
}

pub fn production(request_id: &str, quantity: i64) -> ProductionRequest {
    ProductionRequest::new(request_id, quantity)
}

pub fn reservation(request_id: &str, requester: &str, quantity: i64) -> ReservationRequest {
    ReservationRequest::new(request_id, requester, "sku1", quantity)
}

pub fn is_storage_failure(err: &inventory_service::InventoryError) -> bool {
    matches!(err, inventory_service::InventoryError::Storage { source: RepoError::Backend(_), .. })
}
