//! HTTP query and control surface over a running control loop

pub mod auth;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;

pub use routes::{create_router, serve};
pub use state::AppState;
