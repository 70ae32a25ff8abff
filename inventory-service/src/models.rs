use crate::schema::{product_inventory, production_events, products, reservations};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::{Product, ProductionEvent, Reservation};

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = products)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbProduct {
    pub sku: String,
    pub upc: String,
    pub name: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = product_inventory)]
pub struct DbProductInventory<'a> {
    pub sku: &'a str,
    pub available: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = production_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbProductionEvent {
    pub id: i64,
    pub request_id: String,
    pub sku: String,
    pub quantity: i64,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = production_events)]
pub struct NewDbProductionEvent<'a> {
    pub request_id: &'a str,
    pub sku: &'a str,
    pub quantity: i64,
    pub created: DateTime<Utc>,
}

/// Also loaded by name from the raw reservation listing query.
#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = reservations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbReservation {
    pub id: i64,
    pub request_id: String,
    pub requester: String,
    pub sku: String,
    pub state: String,
    pub reserved_quantity: i64,
    pub requested_quantity: i64,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = reservations)]
pub struct NewDbReservation<'a> {
    pub request_id: &'a str,
    pub requester: &'a str,
    pub sku: &'a str,
    pub state: &'a str,
    pub reserved_quantity: i64,
    pub requested_quantity: i64,
    pub created: DateTime<Utc>,
}

impl From<&Product> for DbProduct {
    fn from(product: &Product) -> Self {
        Self {
            sku: product.sku.clone(),
            upc: product.upc.clone(),
            name: product.name.clone(),
        }
    }
}

impl From<DbProduct> for Product {
    fn from(row: DbProduct) -> Self {
        Product::new(row.sku, row.upc, row.name)
    }
}

impl From<DbProductionEvent> for ProductionEvent {
    fn from(row: DbProductionEvent) -> Self {
        ProductionEvent {
            id: row.id,
            request_id: row.request_id,
            sku: row.sku,
            quantity: row.quantity,
            created: row.created,
        }
    }
}

impl TryFrom<DbReservation> for Reservation {
    type Error = shared::ParseReserveStateError;

    fn try_from(row: DbReservation) -> Result<Self, Self::Error> {
        Ok(Reservation {
            id: row.id,
            state: row.state.parse()?,
            request_id: row.request_id,
            requester: row.requester,
            sku: row.sku,
            reserved_quantity: row.reserved_quantity,
            requested_quantity: row.requested_quantity,
            created: row.created,
        })
    }
}
