//! Postgres [`Repository`] on diesel-async with a bb8 pool.
//!
//! A [`PgTransaction`] owns its pooled connection for its whole life. Nested
//! scopes map onto diesel's transaction depth, which issues `SAVEPOINT`s. A
//! connection dropped while still inside a transaction is treated as broken
//! by the pool and closed, so the server rolls the transaction back.

use crate::models::{
    DbProduct, DbProductInventory, DbProductionEvent, DbReservation, NewDbProductionEvent, NewDbReservation,
};
use crate::repository::{
    Lock, NewProductionEvent, NewReservation, RepoError, RepoResult, Repository, ReservationFilter, Transaction,
};
use crate::schema::{product_inventory, production_events, products, reservations};
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Nullable, Varchar};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use shared::{Product, ProductInventory, ProductionEvent, Reservation, ReserveState};
use tracing::debug;

pub type DbPool = Pool<AsyncPgConnection>;

type PooledConnection = bb8::PooledConnection<'static, AsyncDieselConnectionManager<AsyncPgConnection>>;

impl From<DieselError> for RepoError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => RepoError::NotFound,
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => RepoError::AlreadyExists,
            other => RepoError::Backend(other.into()),
        }
    }
}

fn backend<E>(err: E) -> RepoError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RepoError::Backend(err.into())
}

#[derive(Clone)]
pub struct PgRepository {
    pool: DbPool,
}

pub struct PgTransaction {
    conn: PooledConnection,
}

impl PgRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_size: u32) -> anyhow::Result<Self> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder().max_size(max_size).build(config).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl Repository for PgRepository {
    type Tx = PgTransaction;

    async fn begin(&self) -> RepoResult<PgTransaction> {
        let mut conn = self.pool.get_owned().await.map_err(backend)?;
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::begin_transaction(&mut *conn).await?;
        Ok(PgTransaction { conn })
    }

    async fn get_product(&self, sku: &str) -> RepoResult<Product> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        select_product(&mut conn, sku, Lock::None).await
    }

    async fn get_product_inventory(&self, sku: &str) -> RepoResult<ProductInventory> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        select_product_inventory(&mut conn, sku, Lock::None).await
    }

    async fn get_all_product_inventory(&self, limit: i64, offset: i64) -> RepoResult<Vec<ProductInventory>> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        let rows: Vec<(DbProduct, i64)> = product_inventory::table
            .inner_join(products::table)
            .select((DbProduct::as_select(), product_inventory::available))
            .order(products::sku.asc())
            .limit(limit)
            .offset(offset)
            .load(&mut *conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(product, available)| ProductInventory {
                product: product.into(),
                available,
            })
            .collect())
    }

    async fn get_production_event_by_request_id(&self, request_id: &str) -> RepoResult<ProductionEvent> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        select_production_event(&mut conn, request_id, Lock::None).await
    }

    async fn get_reservation(&self, id: i64) -> RepoResult<Reservation> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        let row: DbReservation = reservations::table
            .find(id)
            .select(DbReservation::as_select())
            .first(&mut *conn)
            .await?;
        Reservation::try_from(row).map_err(backend)
    }

    async fn get_reservation_by_request_id(&self, request_id: &str) -> RepoResult<Reservation> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        select_reservation_by_request_id(&mut conn, request_id, Lock::None).await
    }

    async fn get_reservations(
        &self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
    ) -> RepoResult<Vec<Reservation>> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        select_reservations(&mut conn, filter, limit, offset, Lock::None).await
    }
}

impl PgTransaction {
    fn conn(&mut self) -> &mut AsyncPgConnection {
        &mut self.conn
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn get_product(&mut self, sku: &str, lock: Lock) -> RepoResult<Product> {
        select_product(self.conn(), sku, lock).await
    }

    async fn save_product(&mut self, product: &Product) -> RepoResult<()> {
        diesel::insert_into(products::table)
            .values(DbProduct::from(product))
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn get_product_inventory(&mut self, sku: &str, lock: Lock) -> RepoResult<ProductInventory> {
        select_product_inventory(self.conn(), sku, lock).await
    }

    async fn save_product_inventory(&mut self, inventory: &ProductInventory) -> RepoResult<()> {
        let row = DbProductInventory {
            sku: inventory.sku(),
            available: inventory.available,
        };
        diesel::insert_into(product_inventory::table)
            .values(&row)
            .on_conflict(product_inventory::sku)
            .do_update()
            .set(product_inventory::available.eq(inventory.available))
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn get_production_event_by_request_id(
        &mut self,
        request_id: &str,
        lock: Lock,
    ) -> RepoResult<ProductionEvent> {
        select_production_event(self.conn(), request_id, lock).await
    }

    async fn save_production_event(&mut self, event: NewProductionEvent) -> RepoResult<ProductionEvent> {
        let row = NewDbProductionEvent {
            request_id: &event.request_id,
            sku: &event.sku,
            quantity: event.quantity,
            created: event.created,
        };
        let stored: DbProductionEvent = diesel::insert_into(production_events::table)
            .values(&row)
            .returning(DbProductionEvent::as_returning())
            .get_result(self.conn())
            .await?;
        Ok(stored.into())
    }

    async fn get_reservation_by_request_id(&mut self, request_id: &str, lock: Lock) -> RepoResult<Reservation> {
        select_reservation_by_request_id(self.conn(), request_id, lock).await
    }

    async fn get_reservations(
        &mut self,
        filter: &ReservationFilter,
        limit: i64,
        offset: i64,
        lock: Lock,
    ) -> RepoResult<Vec<Reservation>> {
        select_reservations(self.conn(), filter, limit, offset, lock).await
    }

    async fn save_reservation(&mut self, reservation: NewReservation) -> RepoResult<Reservation> {
        let row = NewDbReservation {
            request_id: &reservation.request_id,
            requester: &reservation.requester,
            sku: &reservation.sku,
            state: reservation.state.as_str(),
            reserved_quantity: reservation.reserved_quantity,
            requested_quantity: reservation.requested_quantity,
            created: reservation.created,
        };
        let stored: DbReservation = diesel::insert_into(reservations::table)
            .values(&row)
            .returning(DbReservation::as_returning())
            .get_result(self.conn())
            .await?;
        Reservation::try_from(stored).map_err(backend)
    }

    async fn update_reservation(&mut self, id: i64, state: ReserveState, reserved_quantity: i64) -> RepoResult<()> {
        let updated = diesel::update(reservations::table.find(id))
            .set((
                reservations::state.eq(state.as_str()),
                reservations::reserved_quantity.eq(reserved_quantity),
            ))
            .execute(self.conn())
            .await?;
        if updated == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn savepoint(&mut self) -> RepoResult<()> {
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::begin_transaction(self.conn()).await?;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> RepoResult<()> {
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::commit_transaction(self.conn()).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> RepoResult<()> {
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::rollback_transaction(self.conn()).await?;
        Ok(())
    }

    async fn commit(mut self) -> RepoResult<()> {
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::commit_transaction(self.conn()).await?;
        Ok(())
    }

    async fn rollback(mut self) -> RepoResult<()> {
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::rollback_transaction(self.conn()).await?;
        Ok(())
    }
}

async fn select_product(conn: &mut AsyncPgConnection, sku: &str, lock: Lock) -> RepoResult<Product> {
    let query = products::table.find(sku).select(DbProduct::as_select());
    let row: DbProduct = if lock.for_update() {
        query.for_update().first(conn).await?
    } else {
        query.first(conn).await?
    };
    Ok(row.into())
}

async fn select_product_inventory(conn: &mut AsyncPgConnection, sku: &str, lock: Lock) -> RepoResult<ProductInventory> {
    let query = product_inventory::table
        .inner_join(products::table)
        .filter(product_inventory::sku.eq(sku))
        .select((DbProduct::as_select(), product_inventory::available));
    let (product, available): (DbProduct, i64) = if lock.for_update() {
        query.for_update().first(conn).await?
    } else {
        query.first(conn).await?
    };
    Ok(ProductInventory {
        product: product.into(),
        available,
    })
}

async fn select_production_event(
    conn: &mut AsyncPgConnection,
    request_id: &str,
    lock: Lock,
) -> RepoResult<ProductionEvent> {
    let query = production_events::table
        .filter(production_events::request_id.eq(request_id))
        .select(DbProductionEvent::as_select());
    let row: DbProductionEvent = if lock.for_update() {
        query.for_update().first(conn).await?
    } else {
        query.first(conn).await?
    };
    Ok(row.into())
}

async fn select_reservation_by_request_id(
    conn: &mut AsyncPgConnection,
    request_id: &str,
    lock: Lock,
) -> RepoResult<Reservation> {
    let query = reservations::table
        .filter(reservations::request_id.eq(request_id))
        .select(DbReservation::as_select());
    let row: DbReservation = if lock.for_update() {
        query.for_update().first(conn).await?
    } else {
        query.first(conn).await?
    };
    Reservation::try_from(row).map_err(backend)
}

// Boxed diesel queries cannot take a locking clause, so the optional filters
// are bound as nullable parameters instead.
const SELECT_RESERVATIONS: &str = "SELECT id, request_id, requester, sku, state, reserved_quantity, \
     requested_quantity, created FROM reservations \
     WHERE ($1::varchar IS NULL OR sku = $1) AND ($2::varchar IS NULL OR state = $2) \
     ORDER BY created ASC, id ASC LIMIT $3 OFFSET $4";

async fn select_reservations(
    conn: &mut AsyncPgConnection,
    filter: &ReservationFilter,
    limit: i64,
    offset: i64,
    lock: Lock,
) -> RepoResult<Vec<Reservation>> {
    let sql = if lock.for_update() {
        format!("{SELECT_RESERVATIONS} FOR UPDATE")
    } else {
        SELECT_RESERVATIONS.to_string()
    };
    debug!(sku = ?filter.sku, state = ?filter.state, limit, offset, ?lock, "selecting reservations");

    let rows: Vec<DbReservation> = diesel::sql_query(sql)
        .bind::<Nullable<Varchar>, _>(filter.sku.as_deref())
        .bind::<Nullable<Varchar>, _>(filter.state.map(|state| state.as_str()))
        .bind::<BigInt, _>(limit)
        .bind::<BigInt, _>(offset)
        .load(conn)
        .await?;
    rows.into_iter()
        .map(|row| Reservation::try_from(row).map_err(backend))
        .collect()
}
