//! Prometheus metrics: request counts and latency per route, and call counts,
//! failures and latency per repository call.

use crate::repository::{
    Lock, NewProductionEvent, NewReservation, RepoResult, Repository, ReservationFilter, Transaction,
};
use async_trait::async_trait;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use shared::{Product, ProductInventory, ProductionEvent, Reservation, ReserveState};
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_latency: HistogramVec,
    repository_calls: IntCounterVec,
    repository_errors: IntCounterVec,
    repository_latency: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let http_requests = IntCounterVec::new(
            Opts::new("inventory_http_requests_total", "Requests served, by route and status"),
            &["method", "route", "status"],
        )?;
        let http_latency = HistogramVec::new(
            HistogramOpts::new("inventory_http_request_duration_seconds", "Time spent serving a request"),
            &["method", "route"],
        )?;
        let repository_calls = IntCounterVec::new(
            Opts::new("inventory_repository_calls_total", "Repository calls made"),
            &["call"],
        )?;
        let repository_errors = IntCounterVec::new(
            Opts::new("inventory_repository_errors_total", "Repository calls that failed"),
            &["call"],
        )?;
        let repository_latency = HistogramVec::new(
            HistogramOpts::new("inventory_repository_call_duration_seconds", "Time spent in a repository call")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["call"],
        )?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_latency.clone()))?;
        registry.register(Box::new(repository_calls.clone()))?;
        registry.register(Box::new(repository_errors.clone()))?;
        registry.register(Box::new(repository_latency.clone()))?;

        Ok(Self {
            registry,
            http_requests,
            http_latency,
            repository_calls,
            repository_errors,
            repository_latency,
        })
    }

    pub fn observe_request(&self, method: &str, route: &str, status: u16, elapsed: Duration) {
        self.http_requests
            .with_label_values(&[method, route, &status.to_string()])
            .inc();
        self.http_latency
            .with_label_values(&[method, route])
            .observe(elapsed.as_secs_f64());
    }

    /// Counts the call now; latency and outcome are recorded by
    /// [`CallTimer::complete`].
    pub fn start_call(&self, call: &'static str) -> CallTimer<'_> {
        self.repository_calls.with_label_values(&[call]).inc();
        CallTimer {
            metrics: self,
            call,
            start: Instant::now(),
        }
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

pub struct CallTimer<'a> {
    metrics: &'a Metrics,
    call: &'static str,
    start: Instant,
}

impl CallTimer<'_> {
    pub fn complete<T>(self, result: &RepoResult<T>) {
        // A missing row is an answer, not a failed call.
        if matches!(result, Err(err) if !err.is_not_found()) {
            self.metrics.repository_errors.with_label_values(&[self.call]).inc();
        }
        self.metrics
            .repository_latency
            .with_label_values(&[self.call])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

async fn timed<T, F>(metrics: &Metrics, call: &'static str, op: F) -> RepoResult<T>
where
    F: Future<Output = RepoResult<T>>,
{
    let timer = metrics.start_call(call);
    let result = op.await;
    timer.complete(&result);
    result
}

/// Repository wrapper that records [`Metrics`] for every call, including the
/// calls made through its transactions.
#[derive(Clone)]
pub struct MeteredRepository<R> {
    inner: R,
    metrics: Metrics,
}

impl<R> MeteredRepository<R> {
    pub fn new(inner: R, metrics: Metrics) -> Self {
        Self { inner, metrics }
    }
}

pub struct MeteredTransaction<T> {
    inner: T,
    metrics: Metrics,
}

#[async_trait]
impl<R: Repository> Repository for MeteredRepository<R> {
    type Tx = MeteredTransaction<R::Tx>;

    async fn begin(&self) -> RepoResult<Self::Tx> {
        let inner = timed(&self.metrics, "begin", self.inner.begin()).await?;
        Ok(MeteredTransaction {
            inner,
            metrics: self.metrics.clone(),
        })
    }

    async fn get_product(&self, sku: &str) -> RepoResult<Product> {
        timed(&self.metrics, "get_product", self.inner.get_product(sku)).await
    }

    async fn get_product_inventory(&self, sku: &str) -> RepoResult<ProductInventory> {
        timed(&self.metrics, "get_product_inventory", self.inner.get_product_inventory(sku)).await
    }

    async fn get_all_product_inventory(&self, limit: i64, offset: i64) -> RepoResult<Vec<ProductInventory>> {
        timed(
            &self.metrics,
            "get_all_product_inventory",
            self.inner.get_all_product_inventory(limit, offset),
        )
        .await
    }

    async fn get_production_event_by_request_id(&self, request_id: &str) -> RepoResult<ProductionEvent> {
        timed(
            &self.metrics,
            "get_production_event_by_request_id",
            self.inner.get_production_event_by_request_id(request_id),
        )
        .await
    }

    async fn get_reservation(&self, id: i64) -> RepoResult<Reservation> {
        timed(&self.metrics, "get_reservation", self.inner.get_reservation(id)).await
    }

    async fn get_reservation_by_request_id(&self, request_id: &str) -> RepoResult<Reservation> {
        timed(
            &self.metrics,
            "get_reservation_by_request_id",
            self.inner.get_reservation_by_request_id(request_id),
        )
        .await
    }

    async fn get_reservations(
        &self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
    ) -> RepoResult<Vec<Reservation>> {
        timed(
            &self.metrics,
            "get_reservations",
            self.inner.get_reservations(filter, limit, offset),
        )
        .await
    }
}

#[async_trait]
impl<T: Transaction> Transaction for MeteredTransaction<T> {
    async fn get_product(&mut self, sku: &str, lock: Lock) -> RepoResult<Product> {
        timed(&self.metrics, "tx.get_product", self.inner.get_product(sku, lock)).await
    }

    async fn save_product(&mut self, product: &Product) -> RepoResult<()> {
        timed(&self.metrics, "tx.save_product", self.inner.save_product(product)).await
    }

    async fn get_product_inventory(&mut self, sku: &str, lock: Lock) -> RepoResult<ProductInventory> {
        timed(
            &self.metrics,
            "tx.get_product_inventory",
            self.inner.get_product_inventory(sku, lock),
        )
        .await
    }

    async fn save_product_inventory(&mut self, inventory: &ProductInventory) -> RepoResult<()> {
        timed(
            &self.metrics,
            "tx.save_product_inventory",
            self.inner.save_product_inventory(inventory),
        )
        .await
    }

    async fn get_production_event_by_request_id(
        &mut self,
        request_id: &str,
        lock: Lock,
    ) -> RepoResult<ProductionEvent> {
        timed(
            &self.metrics,
            "tx.get_production_event_by_request_id",
            self.inner.get_production_event_by_request_id(request_id, lock),
        )
        .await
    }

    async fn save_production_event(&mut self, event: NewProductionEvent) -> RepoResult<ProductionEvent> {
        timed(&self.metrics, "tx.save_production_event", self.inner.save_production_event(event)).await
    }

    async fn get_reservation_by_request_id(&mut self, request_id: &str, lock: Lock) -> RepoResult<Reservation> {
        timed(
            &self.metrics,
            "tx.get_reservation_by_request_id",
            self.inner.get_reservation_by_request_id(request_id, lock),
        )
        .await
    }

    async fn get_reservations(
        &mut self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
        lock: Lock,
    ) -> RepoResult<Vec<Reservation>> {
        timed(
            &self.metrics,
            "tx.get_reservations",
            self.inner.get_reservations(filter, limit, offset, lock),
        )
        .await
    }

    async fn save_reservation(&mut self, reservation: NewReservation) -> RepoResult<Reservation> {
        timed(&self.metrics, "tx.save_reservation", self.inner.save_reservation(reservation)).await
    }

    async fn update_reservation(&mut self, id: i64, state: ReserveState, reserved_quantity: i64) -> RepoResult<()> {
        timed(
            &self.metrics,
            "tx.update_reservation",
            self.inner.update_reservation(id, state, reserved_quantity),
        )
        .await
    }

    async fn savepoint(&mut self) -> RepoResult<()> {
        timed(&self.metrics, "tx.savepoint", self.inner.savepoint()).await
    }

    async fn release_savepoint(&mut self) -> RepoResult<()> {
        timed(&self.metrics, "tx.release_savepoint", self.inner.release_savepoint()).await
    }

    async fn rollback_to_savepoint(&mut self) -> RepoResult<()> {
        timed(&self.metrics, "tx.rollback_to_savepoint", self.inner.rollback_to_savepoint()).await
    }

    async fn commit(self) -> RepoResult<()> {
        let Self { inner, metrics } = self;
        timed(&metrics, "commit", inner.commit()).await
    }

    async fn rollback(self) -> RepoResult<()> {
        let Self { inner, metrics } = self;
        timed(&metrics, "rollback", inner.rollback()).await
    }
}
