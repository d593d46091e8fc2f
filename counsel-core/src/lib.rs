pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod encryption;
pub mod error;
pub mod realtime;
pub mod redis;
pub mod schema;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use context::CounselContext;
pub use db::DbPool;
pub use encryption::ChatCipher;
pub use error::{Error, Result};
pub use realtime::{publish_json, topics, MemoryBus, RealtimeBus, RedisBus, Subscription};
pub use redis::RedisPool;
pub use store::{MemoryStore, PgStore, Store};
