pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod products;
pub mod repository;
pub mod service;
pub mod subscriptions;

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "postgres")]
pub mod models;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod schema;

pub use error::{InventoryError, Result};
pub use events::{EventSink, NoopEventSink};
pub use memory::MemoryRepository;
pub use metrics::{MeteredRepository, Metrics};
pub use repository::{Lock, RepoError, Repository, ReservationFilter, Transaction};
pub use service::{InventoryService, InventorySubscription, ReservationSubscription, ServiceConfig};
