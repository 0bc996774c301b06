pub mod rate_limit;
pub mod validation;

pub use rate_limit::{RateLimitResult, RateLimiter, Resource};
pub use validation::validate_uplink;
