//! Policies applied to delivery attempts.

pub mod retry;

pub use retry::RetryPolicy;
