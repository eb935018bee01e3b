pub mod cache;
pub mod channel;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod session;
pub mod store;
