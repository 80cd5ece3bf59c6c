//! Observability: structured logging setup.

pub mod logging;

pub use logging::{init, init_from_env, LogStyle};
