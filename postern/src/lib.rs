//! Postern, an outbound mail daemon
//!
//! Wires a configured mail store, recipient directory and delivery engine
//! together, and runs the dispatcher until the process is told to stop.

pub mod commands;
pub mod controller;

pub use commands::{MailSummary, SendRequest};
pub use controller::{Postern, SHUTDOWN_BROADCAST};
