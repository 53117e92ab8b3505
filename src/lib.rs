pub mod collectors;
pub mod config;
pub mod constants;
pub mod error;
pub mod loggers;
pub mod logging;
pub mod masker;
pub mod metrics;
pub mod observatory;
pub mod patterns;
pub mod server;
pub mod types;

pub use config::ObservatoryConfig;
pub use error::{ObservatoryError, Result};
pub use observatory::Observatory;
