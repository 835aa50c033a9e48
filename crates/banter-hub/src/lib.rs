pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod presence;
pub mod receipts;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod typing;
pub mod unread;

use std::sync::Arc;

use banter_db::Database;
use tracing::error;

pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use hub::Hub;

/// Run a storage call on the blocking pool.
pub async fn blocking<F, T>(db: &Arc<Database>, f: F) -> HubResult<T>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            HubError::from(e)
        })?
        .map_err(HubError::Storage)
}
