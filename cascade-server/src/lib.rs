//! HTTP control surface for the cascade orchestration core.
//!
//! Exposes execution state polling, stage and pipeline runs, retries,
//! cooperative stop and workflow reconciliation as a small JSON API.
//!
//! ## Modules
//!
//! - [`config`]: configuration from `CASCADE_*` environment variables
//! - [`error`]: [`ApiError`] and its HTTP mapping
//! - [`handlers`]: route handlers
//! - [`router`]: the route table
//! - [`state`]: shared application state

pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use router::build_router;
