//! Accurate Core Library
//!
//! Foundational types shared by every Accurate crate:
//!
//! - Domain models (accounts, balances, rating plans, CDRs, ...)
//! - The structured query language used by aliases, users and filters
//! - Storage traits implemented by the cache and database crates
//! - Unified error handling with stable error prefixes
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod query;
pub mod traits;
pub mod utils;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
