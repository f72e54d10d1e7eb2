pub use crate::proxy::filter::rate_limit::RateLimiter;

#[cfg(test)]
mod rate_limit_tests;
