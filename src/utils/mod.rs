pub mod error;
pub mod limiters;
pub mod rate_limit;
pub mod sanitize;
pub mod token_estimator;

pub use error::ApiError;
