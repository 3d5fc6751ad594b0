pub mod api;
pub mod clients;
pub mod config;
pub mod delivery;
pub mod error;
pub mod extractor;
pub mod models;
pub mod resolver;
pub mod supervisor;
pub mod templates;
pub mod utils;
pub mod worker;
