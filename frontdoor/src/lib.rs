pub mod auth;
pub mod clients;
pub mod config;
pub mod events;
pub mod locks;
pub mod paths;
pub mod repositories;
pub mod resilience;
pub mod routes;
pub mod services;
pub mod store;
pub mod workers;
