mod error;
mod manager;

pub use error::LifecycleError;
pub use manager::{
    live_active_seconds, live_elapsed_minutes, SessionManager, MAX_DURATION_MINUTES,
    MIN_DURATION_MINUTES,
};
