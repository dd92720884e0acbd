pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod routes;
pub mod services;
pub mod startup;
pub mod store;

pub use startup::{AppState, Application, Backends};
