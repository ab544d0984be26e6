//! Hoard: an HTTP caching layer that streams origin responses to clients while writing
//! them through to a transactional Redis store.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod storage;
pub mod util;
