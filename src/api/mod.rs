//! Router API - Types, errors, and status views

mod error;
mod types;

pub use error::{RouterError, RouterResult};
pub use types::{Outcome, Priority, ProviderId, QuotaStatus, ThrottleReason, ThrottleStatus};
