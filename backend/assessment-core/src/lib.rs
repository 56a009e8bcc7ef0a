//! Assessment attempt lifecycle over MongoDB with a Redis cache-aside layer.
//!
//! The request layer authenticates callers and hands a [`models::Caller`] to
//! the services gathered in [`AssessmentCore`].

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::{Conflict, CoreError, CoreResult, Ineligibility};
pub use services::AssessmentCore;
