pub mod cleanup;
pub mod clock;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod server;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub limiter: Arc<rate_limit::RateLimiter>,
    /// Default and maximum lifetime of a secret.
    pub retention: Duration,
}

pub use cleanup::{CleanupConfig, CleanupScheduler, Sweep};
pub use error::SecretError;
pub use rate_limit::RateLimiter;
pub use server::{open_store, resolve_data_dir, router, run, ServerConfig};
pub use store::{PayloadLimits, Secret, Store};
