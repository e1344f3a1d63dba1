pub mod api;
pub mod config;
pub mod errors;
pub mod events;
pub mod http;
pub mod queue;
pub mod utils;
