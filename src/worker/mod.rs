//! Runtime half: a service-worker style cache in front of an origin.

pub mod cache_store;
pub mod client;
pub mod fetcher;
pub(crate) mod json_file;
pub mod model;
pub mod runner;
pub mod state;
pub mod status_store;
