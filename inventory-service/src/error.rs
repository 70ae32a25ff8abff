use crate::repository::RepoError;
use thiserror::Error;

pub type Result<T, E = InventoryError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum InventoryError {
    /// Rejected before any transaction was opened.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("failed to {action}")]
    Storage {
        action: &'static str,
        #[source]
        source: RepoError,
    },

    /// State was committed but could not be delivered to the event sink.
    #[error("failed to publish update")]
    Publish(#[source] anyhow::Error),

    /// The caller's own transaction committed; allocating stock afterwards
    /// failed. Already committed work stays in place.
    #[error("fulfillment of open reservations for {sku} failed")]
    Fulfillment {
        sku: String,
        #[source]
        source: Box<InventoryError>,
    },
}

impl InventoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, InventoryError::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, InventoryError::Validation(_))
    }

    /// Maps a repository error, turning `NotFound` into the engine's own
    /// not-found signal for `entity`.
    pub(crate) fn lookup(entity: &'static str, key: impl ToString, action: &'static str) -> impl FnOnce(RepoError) -> Self {
        move |err| match err {
            RepoError::NotFound => Self::not_found(entity, key),
            source => Self::Storage { action, source },
        }
    }

    pub(crate) fn storage(action: &'static str) -> impl FnOnce(RepoError) -> Self {
        move |source| Self::Storage { action, source }
    }
}
