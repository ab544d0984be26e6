//! Plain data carried between the cache layers.

pub mod entity;
pub mod request;
pub mod response;
pub mod revalidation;
pub mod types;
pub mod upstream;
