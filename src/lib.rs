pub mod cli;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod manager;
pub mod store;
pub mod trigger;
pub mod workflows;
