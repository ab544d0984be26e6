//! Cache addressing, metadata and lifecycle events.
//!
//! A request is mapped to a [`CacheKey`] by a configurable [`CacheKeySpec`]; the key expands
//! into a [`KeyChain`] naming every backing-store key that belongs to the cached response.

pub mod config;
pub mod events;
pub mod key;
pub mod keychain;
pub mod metadata;

pub use self::config::CacheConfig;
pub use events::{Event, EventBus, EventName, HookError};
pub use key::{CacheKey, CacheKeySpec, KeyField};
pub use keychain::KeyChain;
