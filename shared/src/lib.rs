use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A SKU the factory is able to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub upc: String,
    pub name: String,
}

/// Current stock level for a product. `available` is what has not yet been
/// promised to any reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInventory {
    #[serde(flatten)]
    pub product: Product,
    pub available: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionRequest {
    pub request_id: String,
    pub quantity: i64,
}

/// Ledger entry recording one applied production request. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionEvent {
    pub id: i64,
    pub request_id: String,
    pub sku: String,
    pub quantity: i64,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReserveState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid reserve state: {0}")]
pub struct ParseReserveStateError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    pub request_id: String,
    pub requester: String,
    pub sku: String,
    pub quantity: i64,
}

/// Stock set aside for a requester. Filled incrementally until
/// `reserved_quantity == requested_quantity`, at which point it is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: i64,
    pub request_id: String,
    pub requester: String,
    pub sku: String,
    pub state: ReserveState,
    pub reserved_quantity: i64,
    pub requested_quantity: i64,
    pub created: DateTime<Utc>,
}

impl Product {
    pub fn new(sku: impl Into<String>, upc: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            upc: upc.into(),
            name: name.into(),
        }
    }
}

impl ProductInventory {
    pub fn empty(product: Product) -> Self {
        Self { product, available: 0 }
    }

    pub fn sku(&self) -> &str {
        &self.product.sku
    }
}

impl ProductionRequest {
    pub fn new(request_id: impl Into<String>, quantity: i64) -> Self {
        Self {
            request_id: request_id.into(),
            quantity,
        }
    }
}

impl ReserveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReserveState::Open => "Open",
            ReserveState::Closed => "Closed",
        }
    }
}

impl fmt::Display for ReserveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReserveState {
    type Err = ParseReserveStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open" => Ok(ReserveState::Open),
            "Closed" => Ok(ReserveState::Closed),
            other => Err(ParseReserveStateError(other.to_string())),
        }
    }
}

impl ReservationRequest {
    pub fn new(
        request_id: impl Into<String>,
        requester: impl Into<String>,
        sku: impl Into<String>,
        quantity: i64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            requester: requester.into(),
            sku: sku.into(),
            quantity,
        }
    }
}

impl Reservation {
    /// Quantity still owed to the requester.
    pub fn outstanding(&self) -> i64 {
        self.requested_quantity - self.reserved_quantity
    }

    pub fn is_open(&self) -> bool {
        self.state == ReserveState::Open
    }
}
