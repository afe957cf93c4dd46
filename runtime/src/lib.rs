//! Codebox service: HTTP surface over the code executor and the language
//! server bridge.

pub mod audit;
pub mod config;
pub mod server;
pub mod telemetry;

pub use config::Config;
pub use server::{create_app, serve, AppState};
