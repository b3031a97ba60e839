pub mod config;
pub mod credits;
pub mod error;
pub mod routes;
