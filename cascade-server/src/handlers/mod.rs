//! HTTP handlers, grouped by concern.
//!
//! Successful responses carry `"success": true` next to their payload.

pub mod execution;
pub mod failures;
pub mod health;
pub mod retry;
pub mod stages;
pub mod stop;
pub mod workflows;

use serde::Serialize;

/// Success envelope: the payload's fields plus `"success": true`.
#[derive(Debug, Serialize)]
pub struct Success<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Success<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

pub use health::health_check;
