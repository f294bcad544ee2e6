#![forbid(unsafe_code)]

pub mod cli;
pub mod formats;
pub mod front_matter;
pub mod logging;
pub mod manifest;
pub mod routes;
pub mod sections;
pub mod walk;
pub mod worker;
