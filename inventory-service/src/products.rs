//! Product catalogue messages arriving from the broker.

use crate::events::EventSink;
use crate::repository::Repository;
use crate::service::InventoryService;
use shared::Product;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductDisposition {
    Created,
    /// The message can never become a product; it belongs on the dead letter
    /// topic, together with the reason.
    DeadLetter(String),
}

/// Creates the product carried by one JSON message. Creating a product that
/// already exists counts as created.
pub async fn apply_product_message<R, E>(service: &InventoryService<R, E>, payload: &[u8]) -> ProductDisposition
where
    R: Repository,
    E: EventSink,
{
    let product: Product = match serde_json::from_slice(payload) {
        Ok(product) => product,
        Err(e) => {
            error!(error = %e, "failed to parse product message");
            return ProductDisposition::DeadLetter(format!("invalid product message: {e}"));
        }
    };
    if product.sku.is_empty() || product.upc.is_empty() || product.name.is_empty() {
        warn!(sku = %product.sku, "product message is missing required field(s)");
        return ProductDisposition::DeadLetter("missing required field(s)".to_string());
    }

    match service.create_product(product).await {
        Ok(()) => {
            debug!("product message applied");
            ProductDisposition::Created
        }
        Err(e) => {
            error!(error = %e, "failed to create product from message");
            ProductDisposition::DeadLetter(e.to_string())
        }
    }
}
