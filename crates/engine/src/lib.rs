pub mod gateway;
pub mod idempotency;
pub mod status;

pub use gateway::EnqueueGateway;
pub use idempotency::{IdempotencyCache, MemoryIdempotencyCache, RedisIdempotencyCache};
pub use status::{MemoryStatusStore, PgStatusStore, StatusStore};
