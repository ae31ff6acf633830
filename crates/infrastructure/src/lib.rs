pub mod in_memory_queue;
pub mod postgres_queue;
pub mod queue_factory;
pub mod redis_stream;

pub use in_memory_queue::InMemoryQueue;
pub use postgres_queue::PostgresQueue;
pub use queue_factory::QueueFactory;
pub use redis_stream::RedisStreamQueue;

/// Consumer group under which all workers of a tenant compete for jobs.
/// Worker-group affinity narrows delivery inside this group; it is not a
/// consumer group of its own.
pub const WORKER_CONSUMER_GROUP: &str = "workers";
