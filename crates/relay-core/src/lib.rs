pub mod config;
pub mod error;
pub mod security;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{RelayError, Result, UrlViolation};
pub use security::UrlPolicy;
pub use traits::Adapter;
pub use types::*;
