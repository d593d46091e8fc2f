use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{BusBackend, Config, StoreBackend};
use crate::db::{create_pool as create_db_pool, run_migrations};
use crate::encryption::ChatCipher;
use crate::realtime::{MemoryBus, RealtimeBus, RedisBus};
use crate::redis::create_pool as create_redis_pool;
use crate::store::{MemoryStore, PgStore, Store};

/// Shared handles every service is built from.
#[derive(Clone)]
pub struct CounselContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn RealtimeBus>,
    pub clock: Arc<dyn Clock>,
    pub cipher: ChatCipher,
}

impl CounselContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn Store> = match config.backends.store {
            StoreBackend::Postgres => {
                run_migrations(&config.database).await?;
                let db_pool = create_db_pool(&config.database).await?;
                Arc::new(PgStore::new(db_pool))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store, data is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        let bus: Arc<dyn RealtimeBus> = match config.backends.bus {
            BusBackend::Redis => {
                let redis_pool = create_redis_pool(&config.redis).await?;
                Arc::new(RedisBus::new(redis_pool))
            }
            BusBackend::Memory => Arc::new(MemoryBus::new()),
        };

        let cipher = ChatCipher::new(&config.server.encryption_key)?;

        Ok(CounselContext {
            config: Arc::new(config),
            store,
            bus,
            clock: Arc::new(SystemClock),
            cipher,
        })
    }

    /// Fully in-process context over the given clock.
    pub fn in_memory(config: Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let cipher = ChatCipher::new(&config.server.encryption_key)?;
        Ok(CounselContext {
            config: Arc::new(config),
            store: Arc::new(MemoryStore::new()),
            bus: Arc::new(MemoryBus::new()),
            clock,
            cipher,
        })
    }
}
