pub mod api;
pub mod config;
pub mod log_client;
pub mod routes;
pub mod stats;
pub mod url_repo;
pub mod url_service;
