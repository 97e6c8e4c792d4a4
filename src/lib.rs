//! sitecache: a full-page caching engine.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
