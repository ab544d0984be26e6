//! [`JobQueue`](crate::application::jobs::JobQueue) implementations.

mod memory;
mod redis;

pub use self::memory::MemoryJobQueue;
pub use self::redis::RedisJobQueue;
