//! Built-in middleware for the interceptor pipeline
//!
//! All three are installed by [`Pipeline::from_config`](crate::pipeline::Pipeline::from_config)
//! when enabled, in the order logging, timeout, rate limit.

pub mod logging;
pub mod rate_limit;
pub mod timeout;

pub use logging::LoggingMiddleware;
pub use rate_limit::{KeyExtractor, RateLimitMiddleware};
pub use timeout::TimeoutMiddleware;
