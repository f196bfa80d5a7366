use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::db::SqliteStore;

pub struct AppState {
    pub store: SqliteStore,
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
}

impl AppState {
    pub fn new(store: SqliteStore, shutdown_token: CancellationToken) -> Self {
        Self {
            store,
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
        }
    }
}
